//! Connections
//!
//! A [`Connection`] owns one physical transport. Sends are serialised by the
//! lock around the transport writer; the receive side runs as a single
//! listener task per connect that feeds every physical read through a
//! [`BoundaryScanner`] and finalises complete messages in arrival order.
//!
//! ```text
//! send:    producer -> [compress] -> pipe -> pump -> send_part ... marker
//! receive: load_part -> scanner -> pipe -> [decompress] -> consumer -> handler
//! ```

use std::future::Future;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tidewire_core::stats::names;
use tidewire_core::{
    BoundaryScanner, CodecError, Endpoint, MarkerSentinel, OperationMode, OperationWriter,
    PayloadCodec, Result, Scan, ServiceConfig, SlidingDeadline, StateError, StreamOperation,
    TidewireError, TransferError, TransportError, MARKER_LEN,
};

use crate::handler::{ReceivedMessage, SendReport};
use crate::service::ServiceShared;
use crate::transport::{self, LoadPart, TransportPair, TransportReader, TransportWriter};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Disposed,
}

#[derive(Debug, Default)]
struct Counters {
    send_count: AtomicU64,
    send_length: AtomicU64,
    send_errors: AtomicU64,
    receive_count: AtomicU64,
    receive_length: AtomicU64,
    receive_errors: AtomicU64,
}

/// Point-in-time view of a connection for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub name: String,
    pub address: Option<String>,
    pub peer_addr: Option<SocketAddr>,
    pub state: ConnectionState,
    pub send_count: u64,
    pub send_length: u64,
    pub send_errors: u64,
    pub receive_count: u64,
    pub receive_length: u64,
    pub receive_errors: u64,
    pub last_error: Option<String>,
    pub idle_ms: u64,
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

struct ConnectionInner {
    name: String,
    service: Weak<ServiceShared>,
    endpoint: Mutex<Option<Endpoint>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    state: Mutex<ConnectionState>,
    /// Transport writer; holding this lock is the send gate
    writer: AsyncMutex<Option<Box<dyn TransportWriter>>>,
    receive_gate: Arc<Semaphore>,
    /// Cancels the listener task of the current connect
    session: Mutex<Option<CancellationToken>>,
    stamp: Mutex<Instant>,
    counters: Counters,
    last_error: Mutex<Option<String>>,
}

/// Handle to one duplex connection; clones share the same connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(name: String, service: Weak<ServiceShared>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                name,
                service,
                endpoint: Mutex::new(None),
                peer_addr: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                writer: AsyncMutex::new(None),
                receive_gate: Arc::new(Semaphore::new(1)),
                session: Mutex::new(None),
                stamp: Mutex::new(Instant::now()),
                counters: Counters::default(),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Remote endpoint, once connected
    pub fn endpoint(&self) -> Option<Endpoint> {
        lock(&self.inner.endpoint).clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.peer_addr)
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Time of the last successful transfer
    pub fn stamp(&self) -> Instant {
        *lock(&self.inner.stamp)
    }

    pub fn idle_for(&self) -> Duration {
        self.stamp().elapsed()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let counters = &self.inner.counters;
        ConnectionSnapshot {
            name: self.inner.name.clone(),
            address: self.endpoint().map(|e| e.to_string()),
            peer_addr: self.peer_addr(),
            state: self.state(),
            send_count: counters.send_count.load(Ordering::Relaxed),
            send_length: counters.send_length.load(Ordering::Relaxed),
            send_errors: counters.send_errors.load(Ordering::Relaxed),
            receive_count: counters.receive_count.load(Ordering::Relaxed),
            receive_length: counters.receive_length.load(Ordering::Relaxed),
            receive_errors: counters.receive_errors.load(Ordering::Relaxed),
            last_error: self.last_error(),
            idle_ms: self.idle_for().as_millis() as u64,
        }
    }

    /// Whether both handles refer to the same connection
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.inner.state) = state;
    }

    /// Move to `next` unless the connection was disposed in the meantime
    fn advance(&self, next: ConnectionState) -> bool {
        let mut state = lock(&self.inner.state);
        if *state == ConnectionState::Disposed {
            return false;
        }
        *state = next;
        true
    }

    fn disposed_error(&self) -> TidewireError {
        StateError::Disposed {
            name: self.inner.name.clone(),
        }
        .into()
    }

    fn touch(&self) {
        *lock(&self.inner.stamp) = Instant::now();
    }

    fn record_error(&self, error: &TidewireError) {
        *lock(&self.inner.last_error) = Some(error.to_string());
    }

    fn service(&self) -> Result<Arc<ServiceShared>> {
        self.inner
            .service
            .upgrade()
            .ok_or_else(|| StateError::ServiceDropped.into())
    }

    fn session_token(&self) -> CancellationToken {
        lock(&self.inner.session).clone().unwrap_or_default()
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disposed => Err(self.disposed_error()),
            _ => Err(TidewireError::not_connected(self.inner.name.clone())),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open a transport to `endpoint`, register with the service and start
    /// the receive loop
    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        let service = self.service()?;
        {
            let mut state = lock(&self.inner.state);
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                ConnectionState::Disposed => return Err(self.disposed_error()),
                _ => {
                    return Err(StateError::AlreadyConnected {
                        name: self.inner.name.clone(),
                    }
                    .into())
                }
            }
        }

        debug!(connection = %self.name(), address = %endpoint, "Connecting");
        let pair = match transport::connect(&endpoint).await {
            Ok(pair) => pair,
            Err(e) => {
                self.advance(ConnectionState::Disconnected);
                self.record_error(&e);
                warn!(connection = %self.name(), error = %e, "Connect failed");
                service.fault(Some(self.name()), &e).await;
                return Err(e);
            }
        };
        self.attach(&service, pair, Some(endpoint)).await
    }

    /// Bind an established transport to this connection.
    ///
    /// A connection disposed while its transport was being established stays
    /// disposed: the transport is shut down and nothing is registered.
    pub(crate) async fn attach(
        &self,
        service: &Arc<ServiceShared>,
        pair: TransportPair,
        endpoint: Option<Endpoint>,
    ) -> Result<()> {
        let TransportPair {
            mut writer,
            reader,
            peer_addr,
        } = pair;

        if self.state() == ConnectionState::Disposed {
            shutdown_rejected(writer.as_mut()).await;
            return Err(self.disposed_error());
        }
        if let Err(e) = service.register(self) {
            shutdown_rejected(writer.as_mut()).await;
            self.advance(ConnectionState::Disconnected);
            return Err(e);
        }

        *lock(&self.inner.endpoint) = endpoint;
        *lock(&self.inner.peer_addr) = peer_addr;
        *self.inner.writer.lock().await = Some(writer);

        let token = CancellationToken::new();
        *lock(&self.inner.session) = Some(token.clone());
        if !self.advance(ConnectionState::Connected) {
            lock(&self.inner.session).take();
            if let Some(mut writer) = self.inner.writer.lock().await.take() {
                shutdown_rejected(writer.as_mut()).await;
            }
            service.deregister(self);
            debug!(connection = %self.name(), "Disposed while connecting");
            return Err(self.disposed_error());
        }
        self.touch();

        let buffer_size = service.config.buffer_size;
        tokio::spawn(self.clone().listener_loop(reader, buffer_size, token));

        info!(connection = %self.name(), peer = ?peer_addr, "Connected");
        service.handler.on_connected(self.name()).await;
        Ok(())
    }

    /// Stop the receive loop, shut the transport down and deregister.
    ///
    /// Disconnecting a connection that is not connected is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state != ConnectionState::Connected {
                return Ok(());
            }
            *state = ConnectionState::Disconnecting;
        }

        if let Some(token) = lock(&self.inner.session).take() {
            token.cancel();
        }

        let writer = self.inner.writer.lock().await.take();
        let result = match writer {
            Some(mut writer) => writer.shutdown().await.map_err(|e| {
                TidewireError::from(TransportError::DisconnectFailed {
                    name: self.inner.name.clone(),
                    reason: e.to_string(),
                })
            }),
            None => Ok(()),
        };

        self.set_state(ConnectionState::Disconnected);
        if let Err(e) = &result {
            self.record_error(e);
        }
        info!(connection = %self.name(), "Disconnected");

        if let Ok(service) = self.service() {
            service.deregister(self);
            service.handler.on_disconnected(self.name()).await;
        }
        result
    }

    /// Disconnect for good; failures go to the exception hook
    pub async fn dispose(&self) {
        if let Err(e) = self.disconnect().await {
            warn!(connection = %self.name(), error = %e, "Disconnect failed during dispose");
            if let Ok(service) = self.service() {
                service.fault(Some(self.name()), &e).await;
            }
        }
        self.set_state(ConnectionState::Disposed);
        if let Ok(service) = self.service() {
            service.deregister(self);
        }
    }

    // ------------------------------------------------------------------------
    // Send Path
    // ------------------------------------------------------------------------

    /// Send one message
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<SendReport> {
        let payload: Bytes = payload.into();
        self.send_with(move |mut writer| async move {
            let written = writer.write_part(&payload).await;
            finish_producer(writer, written).await;
        })
        .await
    }

    /// Send everything `reader` yields as one message
    pub async fn send_reader<R>(&self, reader: R) -> Result<SendReport>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.send_with(move |mut writer| async move {
            let mut reader = reader;
            let copied = tokio::io::copy(&mut reader, &mut writer).await.map(|_| ());
            finish_producer(writer, copied).await;
        })
        .await
    }

    /// Encode `value` with `codec` and send it as one message.
    ///
    /// Encoding runs on a blocking task and streams straight into the pipe,
    /// so the encoded form is never held in memory as a whole.
    pub async fn send_typed<T, C>(&self, value: T, codec: Arc<C>) -> Result<SendReport>
    where
        T: Serialize + Send + 'static,
        C: PayloadCodec,
    {
        self.send_with(move |writer| async move {
            let mut bridge = SyncIoBridge::new(writer);
            let encoded = tokio::task::spawn_blocking(move || {
                let outcome = {
                    let mut buffered = io::BufWriter::new(&mut bridge);
                    codec
                        .encode_into(&value, &mut buffered)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
                        .and_then(|()| buffered.flush())
                };
                (bridge, outcome)
            })
            .await;

            match encoded {
                Ok((bridge, outcome)) => finish_producer(bridge.into_inner(), outcome).await,
                // The writer dropped inside the failed task completes with a fault
                Err(e) => warn!(error = %e, "Encoder task failed"),
            }
        })
        .await
    }

    async fn send_with<P, Fut>(&self, produce: P) -> Result<SendReport>
    where
        P: FnOnce(OperationWriter) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service = self.service()?;
        self.ensure_connected()?;

        let mut gate = self.inner.writer.lock().await;
        let Some(transport) = gate.as_mut() else {
            return Err(TidewireError::not_connected(self.inner.name.clone()));
        };
        let token = self.session_token();
        let config = &service.config;
        let started = Instant::now();

        let mut operation = StreamOperation::new(
            service.next_operation_id(),
            OperationMode::Send,
            Arc::clone(&service.pool),
            config.compression,
            config.compression_level,
        );
        let producer = tokio::spawn(produce(operation.take_writer()?));

        let outcome = self
            .pump(&mut operation, transport.as_mut(), config, &token)
            .await;

        match outcome {
            Ok(()) => {
                operation.complete_read(None);
                if let Err(e) = producer.await {
                    trace!(error = %e, "Producer task ended abnormally");
                }
                let summary = operation.release().await;
                drop(gate);

                let counters = &self.inner.counters;
                counters.send_count.fetch_add(1, Ordering::Relaxed);
                counters
                    .send_length
                    .fetch_add(summary.transferred, Ordering::Relaxed);
                service
                    .stats
                    .record(names::SEND, 1, summary.wire_bytes + MARKER_LEN as u64);

                let report = SendReport {
                    connection: self.inner.name.clone(),
                    operation_id: summary.id,
                    transferred: summary.transferred,
                    wire_bytes: summary.wire_bytes,
                    parts: summary.parts,
                    elapsed: started.elapsed(),
                };
                debug!(
                    connection = %self.name(),
                    operation = summary.id,
                    bytes = summary.transferred,
                    wire = summary.wire_bytes,
                    "Send finished"
                );
                service.handler.on_send_finish(report.clone()).await;
                Ok(report)
            }
            Err(err) => {
                operation.complete_read(Some(&err.to_string()));
                producer.abort();
                let _ = producer.await;
                let summary = operation.release().await;

                // Terminate the partial message so the peer's scanner resynchronises
                let resynced = if summary.wire_bytes == 0 || token.is_cancelled() {
                    true
                } else {
                    let mut deadline = SlidingDeadline::new(config.transfer_timeout);
                    deadline
                        .guard(transport.send_boundary_marker())
                        .await
                        .and_then(|written| written)
                        .is_ok()
                };
                drop(gate);

                self.inner
                    .counters
                    .send_errors
                    .fetch_add(1, Ordering::Relaxed);
                self.record_error(&err);
                service.stats.record(names::SEND_ERROR, 1, summary.wire_bytes);
                warn!(
                    connection = %self.name(),
                    operation = summary.id,
                    error = %err,
                    "Send failed"
                );
                service.fault(Some(self.name()), &err).await;

                if !resynced || err.is_fatal_to_transport() {
                    debug!(connection = %self.name(), "Transport unusable after send failure");
                    if let Err(e) = self.disconnect().await {
                        service.fault(Some(self.name()), &e).await;
                    }
                }
                Err(err)
            }
        }
    }

    /// Drain the operation's pipe onto the transport, then terminate the
    /// message with the boundary marker. A chunk that would put the marker
    /// on the wire is never written.
    async fn pump(
        &self,
        operation: &mut StreamOperation,
        transport: &mut dyn TransportWriter,
        config: &ServiceConfig,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut deadline = SlidingDeadline::new(config.transfer_timeout);
        let mut buf = vec![0u8; config.buffer_size];
        let reader = operation.reader()?;
        reader.start_read()?;

        let mut sentinel = MarkerSentinel::new();

        loop {
            let n = guarded(&mut deadline, token, reader.read_from_pipe(&mut buf))
                .await?
                .map_err(|e| TidewireError::aborted(e.to_string()))?;
            if n == 0 {
                break;
            }
            if let Some(offset) = sentinel.inspect(&buf[..n]) {
                return Err(TransferError::MarkerInPayload { offset }.into());
            }
            guarded(&mut deadline, token, transport.send_part(&buf[..n])).await??;
            deadline.renew();
            self.touch();
        }

        guarded(&mut deadline, token, transport.send_boundary_marker()).await??;
        self.touch();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Receive Path
    // ------------------------------------------------------------------------

    async fn listener_loop(
        self,
        mut reader: Box<dyn TransportReader>,
        buffer_size: usize,
        token: CancellationToken,
    ) {
        let mut scanner = BoundaryScanner::new();
        let mut buf = vec![0u8; buffer_size];
        let mut inbound: Option<Inbound> = None;

        trace!(connection = %self.name(), "Receive loop started");
        let ended = 'read: loop {
            let loaded = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                loaded = reader.load_part(&mut buf) => Some(loaded),
            };
            let Some(loaded) = loaded else {
                break 'read None;
            };

            match loaded {
                Ok(LoadPart::Data(n)) => {
                    self.touch();
                    scanner.feed(&buf[..n]);
                    while let Some(scan) = scanner.next_scan() {
                        if let Err(e) = self.absorb(&mut inbound, scan).await {
                            break 'read Some(e);
                        }
                    }
                }
                Ok(LoadPart::Eof) => break 'read Some(TidewireError::peer_closed("end of stream")),
                Ok(LoadPart::Closed(reason)) => {
                    break 'read Some(TidewireError::peer_closed(
                        reason.unwrap_or_else(|| "close frame".to_string()),
                    ))
                }
                Err(e) => {
                    self.inner
                        .counters
                        .receive_errors
                        .fetch_add(1, Ordering::Relaxed);
                    self.record_error(&e);
                    if let Ok(service) = self.service() {
                        service.stats.record(names::RECEIVE_ERROR, 1, 0);
                        service.fault(Some(self.name()), &e).await;
                    }
                    break 'read Some(e);
                }
            }
        };

        if let Some(partial) = inbound.take() {
            let reason = match &ended {
                Some(e) => e.to_string(),
                None => "connection closed mid-message".to_string(),
            };
            partial.abandon(&reason).await;
        }

        if let Some(reason) = ended {
            debug!(connection = %self.name(), reason = %reason, "Receive loop ended");
            if let Err(e) = self.disconnect().await {
                if let Ok(service) = self.service() {
                    service.fault(Some(self.name()), &e).await;
                }
            }
        }
    }

    /// Route one scanner result into the current inbound message
    async fn absorb(&self, inbound: &mut Option<Inbound>, scan: Scan) -> Result<()> {
        if scan.body.is_empty() && !scan.boundary_found {
            return Ok(());
        }

        if inbound.is_none() {
            *inbound = Some(self.begin_receive().await?);
        }
        let Some(current) = inbound.as_mut() else {
            return Ok(());
        };

        if !scan.body.is_empty() && !current.discarding {
            if let Err(e) = current.operation.writer()?.write_part(&scan.body).await {
                debug!(
                    connection = %self.name(),
                    error = %e,
                    "Consumer stopped early; discarding until boundary"
                );
                current.discarding = true;
            }
        }

        if scan.boundary_found {
            if let Some(done) = inbound.take() {
                self.finish_receive(done).await?;
            }
        }
        Ok(())
    }

    async fn begin_receive(&self) -> Result<Inbound> {
        let service = self.service()?;
        let permit = Arc::clone(&self.inner.receive_gate)
            .acquire_owned()
            .await
            .map_err(|_| StateError::Disposed {
                name: self.inner.name.clone(),
            })?;

        let config = &service.config;
        let mut operation = StreamOperation::new(
            service.next_operation_id(),
            OperationMode::Receive,
            Arc::clone(&service.pool),
            config.compression,
            config.compression_level,
        );
        let mut reader = operation.take_reader()?;
        reader.start_read()?;

        let consumer = tokio::spawn(async move {
            let payload = reader.read_payload().await;
            match &payload {
                Ok(_) => reader.complete(None),
                Err(e) => reader.complete(Some(&e.to_string())),
            }
            payload
        });

        trace!(connection = %self.name(), operation = operation.id(), "Receive started");
        Ok(Inbound {
            operation,
            consumer,
            permit,
            discarding: false,
        })
    }

    async fn finish_receive(&self, inbound: Inbound) -> Result<()> {
        let Inbound {
            mut operation,
            consumer,
            permit,
            ..
        } = inbound;

        operation.complete_write(None).await;
        let payload = consumer
            .await
            .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
        let summary = operation.release().await;
        drop(permit);

        let service = self.service()?;
        let counters = &self.inner.counters;
        match payload {
            Ok(payload) => {
                counters.receive_count.fetch_add(1, Ordering::Relaxed);
                counters
                    .receive_length
                    .fetch_add(summary.transferred, Ordering::Relaxed);
                service
                    .stats
                    .record(names::RECEIVE, 1, summary.wire_bytes + MARKER_LEN as u64);
                debug!(
                    connection = %self.name(),
                    operation = summary.id,
                    bytes = summary.transferred,
                    wire = summary.wire_bytes,
                    "Receive finished"
                );
                service
                    .handler
                    .on_receive_finish(ReceivedMessage {
                        connection: self.inner.name.clone(),
                        operation_id: summary.id,
                        payload,
                        transferred: summary.transferred,
                        wire_bytes: summary.wire_bytes,
                        parts: summary.parts,
                    })
                    .await;
            }
            Err(e) => {
                let err = TidewireError::from(CodecError::Decode(e.to_string()));
                counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                self.record_error(&err);
                service
                    .stats
                    .record(names::RECEIVE_ERROR, 1, summary.wire_bytes);
                warn!(
                    connection = %self.name(),
                    operation = summary.id,
                    error = %err,
                    "Received payload could not be decoded"
                );
                service.fault(Some(self.name()), &err).await;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// A receive in progress
struct Inbound {
    operation: StreamOperation,
    consumer: JoinHandle<io::Result<Bytes>>,
    permit: OwnedSemaphorePermit,
    /// Set once the consumer stopped reading; bytes are dropped until the boundary
    discarding: bool,
}

impl Inbound {
    async fn abandon(mut self, reason: &str) {
        self.operation.complete_write(Some(reason)).await;
        let _ = self.consumer.await;
        let summary = self.operation.release().await;
        drop(self.permit);
        trace!(operation = summary.id, reason, "Partial message abandoned");
    }
}

/// Run `fut` under the sliding deadline unless the session is cancelled
async fn guarded<F: Future>(
    deadline: &mut SlidingDeadline,
    token: &CancellationToken,
    fut: F,
) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TidewireError::aborted("connection closed")),
        output = deadline.guard(fut) => output,
    }
}

async fn finish_producer(mut writer: OperationWriter, outcome: io::Result<()>) {
    match outcome {
        Ok(()) => writer.complete(None).await,
        Err(e) => writer.complete(Some(&e.to_string())).await,
    }
}

async fn shutdown_rejected(writer: &mut dyn TransportWriter) {
    if let Err(close) = writer.shutdown().await {
        trace!(error = %close, "Shutdown of rejected transport failed");
    }
}
