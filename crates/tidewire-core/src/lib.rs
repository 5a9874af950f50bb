//! Tidewire Core
//!
//! Transport-independent building blocks for the tidewire framed streaming
//! transport: boundary-marker framing, bounded in-process pipes and their
//! pool, per-message stream operations with optional compression, sliding
//! deadlines, addressing and service configuration.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod address;
pub mod boundary;
pub mod codec;
pub mod compression;
pub mod config;
pub mod deadline;
pub mod errors;
pub mod operation;
pub mod pipe;
pub mod stats;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use address::{Endpoint, Scheme};
pub use boundary::{
    contains_marker, find_marker, BoundaryScanner, MarkerSentinel, Scan, BOUNDARY_MARKER, MARKER_LEN,
};
pub use codec::{BincodeCodec, JsonCodec, PayloadCodec};
pub use compression::{CompressionLevel, CompressionMode};
pub use config::ServiceConfig;
pub use deadline::SlidingDeadline;
pub use errors::{
    AddressError, CodecError, ConfigError, ErrorCategory, Result, StateError, TidewireError,
    TransferError, TransportError,
};
pub use operation::{
    OperationMode, OperationReader, OperationSummary, OperationWriter, SideState,
    StreamOperation,
};
pub use pipe::{Pipe, PipeControl, PipePool, PipeReader, PipeWriter, PoolStats};
pub use stats::{CounterStats, NoopStats, StatCounter, StatsSink};
