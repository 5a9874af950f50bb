//! Transport service
//!
//! A [`Service`] owns the listening socket, the accept loop, the registry of
//! connections and the idle sweep. It is also the factory for client-side
//! connections, which share its pipe pool, configuration and observers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tidewire_core::stats::names;
use tidewire_core::{
    Endpoint, NoopStats, PipePool, PoolStats, Result, Scheme, ServiceConfig, StateError,
    StatsSink, TidewireError, TransportError,
};

use crate::connection::Connection;
use crate::handler::{NoopHandler, SendReport, ServiceFault, ServiceHandler};
use crate::transport::Listener;

/// Pause before accepting again after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

struct ListenerTasks {
    token: CancellationToken,
    endpoint: Endpoint,
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
    sweep: Option<JoinHandle<()>>,
}

/// State shared by the service handle, its tasks and its connections
pub(crate) struct ServiceShared {
    pub(crate) config: ServiceConfig,
    pub(crate) pool: Arc<PipePool>,
    pub(crate) handler: Arc<dyn ServiceHandler>,
    pub(crate) stats: Arc<dyn StatsSink>,
    registry: DashMap<String, Connection>,
    online: AtomicBool,
    next_operation: AtomicU64,
    next_connection: AtomicU64,
    listener: Mutex<Option<ListenerTasks>>,
}

impl ServiceShared {
    pub(crate) fn next_operation_id(&self) -> u64 {
        self.next_operation.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate_name(&self) -> String {
        format!("conn-{}", self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Insert `connection` into the registry; re-registering the same
    /// connection is a no-op
    pub(crate) fn register(&self, connection: &Connection) -> Result<()> {
        match self.registry.entry(connection.name().to_string()) {
            Entry::Occupied(existing) if existing.get().same(connection) => Ok(()),
            Entry::Occupied(existing) => Err(StateError::DuplicateConnection {
                name: existing.key().clone(),
            }
            .into()),
            Entry::Vacant(slot) => {
                slot.insert(connection.clone());
                trace!(connection = %connection.name(), "Registered");
                Ok(())
            }
        }
    }

    /// Remove `connection` if it is the registered entry under its name
    pub(crate) fn deregister(&self, connection: &Connection) {
        if self
            .registry
            .remove_if(connection.name(), |_, existing| existing.same(connection))
            .is_some()
        {
            trace!(connection = %connection.name(), "Deregistered");
        }
    }

    /// Route a fault to the exception hook
    pub(crate) async fn fault(&self, connection: Option<&str>, error: &TidewireError) {
        self.handler
            .on_exception(ServiceFault::new(connection, error))
            .await;
    }
}

// ----------------------------------------------------------------------------
// Service Builder
// ----------------------------------------------------------------------------

/// Builder wiring configuration and observers into a [`Service`]
pub struct ServiceBuilder {
    config: ServiceConfig,
    handler: Arc<dyn ServiceHandler>,
    stats: Arc<dyn StatsSink>,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            handler: Arc::new(NoopHandler),
            stats: Arc::new(NoopStats),
        }
    }

    /// Observer receiving lifecycle, transfer and fault events
    pub fn with_handler(mut self, handler: Arc<dyn ServiceHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Sink receiving transfer statistics
    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    /// Validate the configuration and create the service (offline)
    pub fn build(self) -> Result<Service> {
        self.config.validate()?;
        let pool = Arc::new(PipePool::new(
            self.config.pipe_capacity,
            self.config.max_pooled_pipes,
        ));
        Ok(Service {
            shared: Arc::new(ServiceShared {
                config: self.config,
                pool,
                handler: self.handler,
                stats: self.stats,
                registry: DashMap::new(),
                online: AtomicBool::new(false),
                next_operation: AtomicU64::new(1),
                next_connection: AtomicU64::new(1),
                listener: Mutex::new(None),
            }),
        })
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

/// Outcome of [`Service::broadcast`]
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<SendReport>,
    pub failed: Vec<(String, TidewireError)>,
}

/// Handle to a transport service; clones share the same service
#[derive(Clone)]
pub struct Service {
    shared: Arc<ServiceShared>,
}

impl Service {
    pub fn builder(config: ServiceConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    /// Service with no observers
    pub fn new(config: ServiceConfig) -> Result<Self> {
        ServiceBuilder::new(config).build()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.shared.config
    }

    pub fn is_online(&self) -> bool {
        self.shared.is_online()
    }

    /// Endpoint actually bound while online (with the real port for `:0`)
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        lock(&self.shared.listener)
            .as_ref()
            .map(|tasks| tasks.endpoint.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.listener)
            .as_ref()
            .map(|tasks| tasks.local_addr)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    // ------------------------------------------------------------------------
    // Listener
    // ------------------------------------------------------------------------

    /// Start listening with the configured backlog
    pub async fn start(&self) -> Result<Endpoint> {
        self.start_listener(self.shared.config.backlog).await
    }

    /// Bind the configured address, then start the accept loop and, when a
    /// connection timeout is configured, the idle sweep
    pub async fn start_listener(&self, backlog: u32) -> Result<Endpoint> {
        let shared = &self.shared;
        let address = shared
            .config
            .address
            .clone()
            .ok_or(StateError::AddressMissing)?;
        if shared
            .online
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StateError::AlreadyOnline.into());
        }

        let bound = async {
            let listener = Listener::bind(&address, backlog).await?;
            let endpoint = listener.local_endpoint()?;
            let local_addr = listener.local_addr()?;
            Ok::<_, TidewireError>((listener, endpoint, local_addr))
        }
        .await;
        let (listener, endpoint, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                shared.online.store(false, Ordering::Release);
                warn!(address = %address, error = %e, "Bind failed");
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            Arc::downgrade(shared),
            listener,
            token.clone(),
        ));
        let sweep = shared.config.sweep_period().map(|period| {
            tokio::spawn(sweep_loop(Arc::downgrade(shared), period, token.clone()))
        });

        *lock(&shared.listener) = Some(ListenerTasks {
            token,
            endpoint: endpoint.clone(),
            local_addr,
            accept,
            sweep,
        });

        info!(address = %endpoint, backlog, "Service listening");
        shared.handler.on_started(&endpoint).await;
        Ok(endpoint)
    }

    /// Unbind, dispose every connection and clear the registry
    pub async fn stop_listener(&self) -> Result<()> {
        let tasks = lock(&self.shared.listener).take();
        let Some(tasks) = tasks else {
            return Err(StateError::ServiceOffline.into());
        };

        self.shared.online.store(false, Ordering::Release);
        tasks.token.cancel();
        if let Err(e) = tasks.accept.await {
            debug!(error = %e, "Accept loop ended abnormally");
        }
        if let Some(sweep) = tasks.sweep {
            if let Err(e) = sweep.await {
                debug!(error = %e, "Idle sweep ended abnormally");
            }
        }

        let connections = self.connections();
        join_all(connections.iter().map(Connection::dispose)).await;
        self.shared.registry.clear();

        info!(address = %tasks.endpoint, disposed = connections.len(), "Service stopped");
        self.shared.handler.on_stopped().await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Create an unconnected client connection; `None` picks a unique name
    pub fn create_connection(&self, name: Option<&str>) -> Result<Connection> {
        let name = match name {
            Some(name) if self.shared.registry.contains_key(name) => {
                return Err(StateError::DuplicateConnection {
                    name: name.to_string(),
                }
                .into())
            }
            Some(name) => name.to_string(),
            None => self.shared.allocate_name(),
        };
        Ok(Connection::new(name, Arc::downgrade(&self.shared)))
    }

    /// Create a client connection and connect it to `endpoint`
    pub async fn connect(&self, endpoint: Endpoint) -> Result<Connection> {
        let connection = self.create_connection(None)?;
        connection.connect(endpoint).await?;
        Ok(connection)
    }

    pub fn connection(&self, name: &str) -> Option<Connection> {
        self.shared
            .registry
            .get(name)
            .map(|entry| entry.value().clone())
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.shared
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Send `payload` to every registered connection concurrently
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> BroadcastReport {
        let payload: Bytes = payload.into();
        let connections = self.connections();
        let results = join_all(connections.iter().map(|connection| {
            let payload = payload.clone();
            async move { (connection.name().to_string(), connection.send(payload).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (name, result) in results {
            match result {
                Ok(sent) => report.delivered.push(sent),
                Err(e) => report.failed.push((name, e)),
            }
        }
        report
    }

    /// Dispose every connection idle for longer than the transfer timeout;
    /// returns the names of the removed connections
    pub async fn sweep_idle(&self) -> Vec<String> {
        sweep_idle(&self.shared).await
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("address", &self.shared.config.address)
            .field("online", &self.is_online())
            .field("connections", &self.connection_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Background Tasks
// ----------------------------------------------------------------------------

enum AcceptStep {
    Stop,
    Reaped,
    Socket(std::io::Result<(TcpStream, SocketAddr)>),
}

/// Accept sockets until cancelled; in-flight admissions are drained before
/// the loop returns so nothing registers after the service stops
async fn accept_loop(shared: Weak<ServiceShared>, listener: Listener, token: CancellationToken) {
    let mut admissions = JoinSet::new();
    loop {
        let step = tokio::select! {
            biased;
            _ = token.cancelled() => AcceptStep::Stop,
            Some(done) = admissions.join_next(), if !admissions.is_empty() => {
                if let Err(e) = done {
                    debug!(error = %e, "Admission task ended abnormally");
                }
                AcceptStep::Reaped
            }
            accepted = listener.accept() => AcceptStep::Socket(accepted),
        };
        let accepted = match step {
            AcceptStep::Stop => break,
            AcceptStep::Reaped => continue,
            AcceptStep::Socket(accepted) => accepted,
        };
        let Some(service) = shared.upgrade() else { break };

        match accepted {
            Ok((stream, peer)) => {
                service.stats.record(names::ACCEPT, 1, 0);
                trace!(%peer, "Accepted socket");
                admissions.spawn(admit(
                    service,
                    listener.scheme(),
                    stream,
                    peer,
                    token.clone(),
                ));
            }
            // Accept errors after going offline are an expected part of shutdown
            Err(_) if !service.is_online() => break,
            Err(e) => {
                let err = TidewireError::from(TransportError::AcceptFailed {
                    reason: e.to_string(),
                });
                warn!(error = %err, "Accept failed");
                service.fault(None, &err).await;
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }

    let pending = admissions.len();
    while let Some(done) = admissions.join_next().await {
        if let Err(e) = done {
            debug!(error = %e, "Admission task ended abnormally");
        }
    }
    debug!(pending, "Accept loop stopped");
}

/// Upgrade an accepted socket and bind it to a new registered connection.
/// A handshake still running when the service stops is abandoned.
async fn admit(
    service: Arc<ServiceShared>,
    scheme: Scheme,
    stream: TcpStream,
    peer: SocketAddr,
    token: CancellationToken,
) {
    let upgraded = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!(%peer, "Handshake abandoned on shutdown");
            return;
        }
        upgraded = Listener::upgrade(scheme, stream, peer) => upgraded,
    };
    let mut pair = match upgraded {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%peer, error = %e, "Handshake failed");
            service.fault(None, &e).await;
            return;
        }
    };

    // stop_listener flips this before cancelling, and waits for this task
    // before it disposes the registry
    if !service.is_online() {
        let _ = pair.writer.shutdown().await;
        return;
    }

    let connection = Connection::new(service.allocate_name(), Arc::downgrade(&service));
    let endpoint = Endpoint::from_socket_addr(scheme, peer).ok();
    if let Err(e) = connection.attach(&service, pair, endpoint).await {
        service.fault(Some(connection.name()), &e).await;
    }
}

async fn sweep_loop(shared: Weak<ServiceShared>, period: Duration, token: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(service) = shared.upgrade() else { break };
        sweep_idle(&service).await;
    }
    debug!("Idle sweep stopped");
}

async fn sweep_idle(service: &Arc<ServiceShared>) -> Vec<String> {
    let threshold = service.config.transfer_timeout;
    if threshold.is_zero() {
        return Vec::new();
    }

    // Collect first so removal never races the iteration
    let expired: Vec<Connection> = service
        .registry
        .iter()
        .filter(|entry| entry.value().idle_for() > threshold)
        .map(|entry| entry.value().clone())
        .collect();

    let mut swept = Vec::with_capacity(expired.len());
    for connection in expired {
        info!(
            connection = %connection.name(),
            idle_ms = connection.idle_for().as_millis() as u64,
            "Connection idle past transfer timeout"
        );
        service.stats.record(names::TIMEOUT, 1, 0);
        service.handler.on_timeout(connection.name()).await;
        connection.dispose().await;
        swept.push(connection.name().to_string());
    }
    swept
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
