//! Error types for the tidewire transport
//!
//! Errors are grouped by the kind of fault they describe: transport faults
//! (connect, accept, disconnect), transfer faults (one send or receive),
//! protocol faults (payloads that cannot be decoded) and state faults
//! (misuse of an operation or connection). `TidewireError` unifies them.

use std::io;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Faults raised while establishing or tearing down a physical transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },
    #[error("Accept failed: {reason}")]
    AcceptFailed { reason: String },
    #[error("Disconnect of {name} failed: {reason}")]
    DisconnectFailed { name: String, reason: String },
    #[error("WebSocket error: {reason}")]
    WebSocket { reason: String },
}

/// Faults isolated to a single send or receive operation
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Transfer timed out after {duration_ms}ms without progress")]
    Timeout { duration_ms: u64 },
    #[error("Payload bytes contain the boundary marker at wire offset {offset}")]
    MarkerInPayload { offset: u64 },
    #[error("Peer closed the connection: {reason}")]
    PeerClosed { reason: String },
    #[error("Transfer aborted: {reason}")]
    Aborted { reason: String },
}

/// Misuse of an operation, connection or service
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Read side of operation {operation_id} was already started")]
    ReadAlreadyStarted { operation_id: u64 },
    #[error("Operation {operation_id} has no {side} half left to take")]
    HalfTaken { operation_id: u64, side: &'static str },
    #[error("Connection {name} is not connected")]
    NotConnected { name: String },
    #[error("Connection {name} already has a bound transport")]
    AlreadyConnected { name: String },
    #[error("Connection {name} was disposed")]
    Disposed { name: String },
    #[error("Connection name {name} is already registered")]
    DuplicateConnection { name: String },
    #[error("Service address is not set")]
    AddressMissing,
    #[error("Service is already online")]
    AlreadyOnline,
    #[error("Service is offline")]
    ServiceOffline,
    #[error("Owning service has been dropped")]
    ServiceDropped,
}

/// Faults raised by the payload codec collaborator
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Encoding failed: {0}")]
    Encode(String),
    #[error("Decoding failed: {0}")]
    Decode(String),
}

/// Invalid or unreadable configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Configuration could not be parsed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Malformed or unsupported endpoint URIs
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid address {input}: {reason}")]
    Invalid { input: String, reason: String },
    #[error("Unknown scheme {scheme}")]
    UnknownScheme { scheme: String },
    #[error("Scheme {scheme} is not served by this transport layer")]
    UnsupportedScheme { scheme: String },
    #[error("Address {input} has no host or port")]
    MissingHostOrPort { input: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error type for the tidewire transport
#[derive(Debug, thiserror::Error)]
pub enum TidewireError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type used throughout tidewire
pub type Result<T> = core::result::Result<T, TidewireError>;

/// Coarse classification used when routing faults to the service hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connect, accept and disconnect failures
    Transport,
    /// Send and receive failures, including timeouts
    Transfer,
    /// Payloads that cannot be decoded
    Protocol,
    /// Programming or lifecycle misuse
    State,
}

impl TidewireError {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            TidewireError::Transport(_) => ErrorCategory::Transport,
            TidewireError::Transfer(_) | TidewireError::Io(_) => ErrorCategory::Transfer,
            TidewireError::Codec(_) => ErrorCategory::Protocol,
            TidewireError::State(_) | TidewireError::Config(_) | TidewireError::Address(_) => {
                ErrorCategory::State
            }
        }
    }

    /// Whether this error means the underlying transport can no longer be used
    pub fn is_fatal_to_transport(&self) -> bool {
        match self {
            TidewireError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            TidewireError::Transfer(TransferError::PeerClosed { .. }) => true,
            TidewireError::Transport(TransportError::WebSocket { .. }) => true,
            _ => false,
        }
    }

    /// Create a timeout error for the given deadline
    pub fn timeout(duration: core::time::Duration) -> Self {
        TidewireError::Transfer(TransferError::Timeout {
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Create a connection failure error
    pub fn connection_failed<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        TidewireError::Transport(TransportError::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        })
    }

    /// Create a WebSocket protocol error
    pub fn websocket<R: Into<String>>(reason: R) -> Self {
        TidewireError::Transport(TransportError::WebSocket {
            reason: reason.into(),
        })
    }

    /// Create a not-connected error for the named connection
    pub fn not_connected<N: Into<String>>(name: N) -> Self {
        TidewireError::State(StateError::NotConnected { name: name.into() })
    }

    /// Create a peer-closed error
    pub fn peer_closed<R: Into<String>>(reason: R) -> Self {
        TidewireError::Transfer(TransferError::PeerClosed {
            reason: reason.into(),
        })
    }

    /// Create an aborted-transfer error
    pub fn aborted<R: Into<String>>(reason: R) -> Self {
        TidewireError::Transfer(TransferError::Aborted {
            reason: reason.into(),
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
