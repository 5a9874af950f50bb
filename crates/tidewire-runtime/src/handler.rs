//! Service observer surface
//!
//! The owner of a [`Service`](crate::Service) observes lifecycle, transfer and
//! fault events through a [`ServiceHandler`]. Every callback has a no-op
//! default. [`ChannelHandler`] forwards all of them as [`ServiceEvent`]s over
//! an mpsc channel for owners that prefer a receive loop to callbacks.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use tidewire_core::{Endpoint, ErrorCategory, PayloadCodec, Result, TidewireError};

// ----------------------------------------------------------------------------
// Event Payloads
// ----------------------------------------------------------------------------

/// Outcome of one completed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub connection: String,
    pub operation_id: u64,
    /// Application payload bytes
    pub transferred: u64,
    /// Bytes written to the transport, excluding the boundary marker
    pub wire_bytes: u64,
    /// Transport writes issued for the payload
    pub parts: u64,
    pub elapsed: Duration,
}

/// One complete message delivered by a connection's receive loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub connection: String,
    pub operation_id: u64,
    /// Decompressed payload
    pub payload: Bytes,
    /// Payload bytes after decompression
    pub transferred: u64,
    /// Raw bytes read from the transport, excluding the boundary marker
    pub wire_bytes: u64,
    /// Pipe writes issued for the raw bytes
    pub parts: u64,
}

impl ReceivedMessage {
    /// Decode the payload as a typed value
    pub fn decode<T, C>(&self, codec: &C) -> Result<T>
    where
        T: DeserializeOwned,
        C: PayloadCodec,
    {
        Ok(codec.decode(&self.payload)?)
    }
}

/// A fault routed to the service's exception hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFault {
    /// Connection the fault belongs to, if any
    pub connection: Option<String>,
    pub category: ErrorCategory,
    pub message: String,
}

impl ServiceFault {
    pub fn new(connection: Option<&str>, error: &TidewireError) -> Self {
        Self {
            connection: connection.map(str::to_string),
            category: error.category(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for ServiceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.connection {
            Some(name) => write!(f, "[{}] {:?}: {}", name, self.category, self.message),
            None => write!(f, "{:?}: {}", self.category, self.message),
        }
    }
}

// ----------------------------------------------------------------------------
// Handler Trait
// ----------------------------------------------------------------------------

/// Observer of service events
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn on_started(&self, _endpoint: &Endpoint) {}

    async fn on_stopped(&self) {}

    /// Fired after the connection has been registered
    async fn on_connected(&self, _connection: &str) {}

    async fn on_disconnected(&self, _connection: &str) {}

    async fn on_send_finish(&self, _report: SendReport) {}

    async fn on_receive_finish(&self, _message: ReceivedMessage) {}

    /// Fired by the idle sweep before the connection is disposed
    async fn on_timeout(&self, _connection: &str) {}

    async fn on_exception(&self, _fault: ServiceFault) {}
}

/// Handler that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl ServiceHandler for NoopHandler {}

// ----------------------------------------------------------------------------
// Channel Handler
// ----------------------------------------------------------------------------

/// Service events as channel messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Started { endpoint: Endpoint },
    Stopped,
    Connected { connection: String },
    Disconnected { connection: String },
    SendFinished(SendReport),
    ReceiveFinished(ReceivedMessage),
    TimedOut { connection: String },
    Exception(ServiceFault),
}

/// Forwards every callback into an unbounded channel
///
/// The channel is unbounded so a slow consumer never stalls a receive loop.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ServiceEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: ServiceEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl ServiceHandler for ChannelHandler {
    async fn on_started(&self, endpoint: &Endpoint) {
        self.emit(ServiceEvent::Started {
            endpoint: endpoint.clone(),
        });
    }

    async fn on_stopped(&self) {
        self.emit(ServiceEvent::Stopped);
    }

    async fn on_connected(&self, connection: &str) {
        self.emit(ServiceEvent::Connected {
            connection: connection.to_string(),
        });
    }

    async fn on_disconnected(&self, connection: &str) {
        self.emit(ServiceEvent::Disconnected {
            connection: connection.to_string(),
        });
    }

    async fn on_send_finish(&self, report: SendReport) {
        self.emit(ServiceEvent::SendFinished(report));
    }

    async fn on_receive_finish(&self, message: ReceivedMessage) {
        self.emit(ServiceEvent::ReceiveFinished(message));
    }

    async fn on_timeout(&self, connection: &str) {
        self.emit(ServiceEvent::TimedOut {
            connection: connection.to_string(),
        });
    }

    async fn on_exception(&self, fault: ServiceFault) {
        self.emit(ServiceEvent::Exception(fault));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
