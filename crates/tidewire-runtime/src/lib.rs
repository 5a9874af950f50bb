//! Tidewire Runtime
//!
//! The asynchronous half of the tidewire transport:
//! - `Service`: listener, accept loop, connection registry and idle sweep
//! - `Connection`: one duplex transport with serialised sends and a single
//!   receive loop
//! - `transport`: TCP and WebSocket implementations of the transport traits
//! - `handler`: observer callbacks and their channel-based adapter
//!
//! Framing, pipes, compression and configuration live in `tidewire-core`;
//! the commonly used items are re-exported here.

pub mod connection;
pub mod handler;
pub mod service;
pub mod transport;

pub use connection::{Connection, ConnectionSnapshot, ConnectionState};
pub use handler::{
    ChannelHandler, NoopHandler, ReceivedMessage, SendReport, ServiceEvent, ServiceFault,
    ServiceHandler,
};
pub use service::{BroadcastReport, Service, ServiceBuilder};
pub use transport::{LoadPart, TransportReader, TransportWriter};

// Re-export core types for convenience
pub use tidewire_core::{
    BincodeCodec, CompressionLevel, CompressionMode, CounterStats, Endpoint, ErrorCategory,
    JsonCodec, NoopStats, PayloadCodec, Result, Scheme, ServiceConfig, StatsSink, TidewireError,
};
