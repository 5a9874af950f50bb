//! Tidewire application: one service plus its event stream

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use tidewire_core::stats::names;
use tidewire_runtime::{
    ChannelHandler, Connection, CounterStats, Endpoint, ReceivedMessage, SendReport, Service,
    ServiceEvent,
};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Where the payload of a `send` comes from
#[derive(Debug, Clone)]
pub enum PayloadSource {
    Text(String),
    File(std::path::PathBuf),
}

/// Outcome of an echo check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoSummary {
    pub rounds: u32,
    pub bytes_per_round: usize,
    pub total_elapsed: Duration,
}

/// Core tidewire application
pub struct TidewireApp {
    config: AppConfig,
    service: Service,
    events: UnboundedReceiver<ServiceEvent>,
    stats: Arc<CounterStats>,
}

impl TidewireApp {
    /// Build the service described by `config`
    pub fn new(config: AppConfig) -> Result<Self> {
        let (handler, events) = ChannelHandler::new();
        let stats = Arc::new(CounterStats::new());
        let service = Service::builder(config.service.clone())
            .with_handler(Arc::new(handler))
            .with_stats(stats.clone())
            .build()?;

        Ok(Self {
            config,
            service,
            events,
            stats,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    // ------------------------------------------------------------------------
    // Serve
    // ------------------------------------------------------------------------

    /// Listen until Ctrl-C, optionally echoing every message back
    pub async fn serve(&mut self, echo: bool) -> Result<()> {
        let endpoint = self.service.start().await?;
        info!("Listening on {}", endpoint);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    break;
                }
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_serve_event(event, echo).await;
                }
            }
        }

        self.service.stop_listener().await?;
        if self.config.cli.print_stats {
            println!("{}", self.stats_json()?);
        }
        Ok(())
    }

    async fn handle_serve_event(&self, event: ServiceEvent, echo: bool) {
        match event {
            ServiceEvent::Connected { connection } => info!("{} connected", connection),
            ServiceEvent::Disconnected { connection } => info!("{} disconnected", connection),
            ServiceEvent::TimedOut { connection } => info!("{} idle, dropped", connection),
            ServiceEvent::Exception(fault) => warn!("{}", fault),
            ServiceEvent::ReceiveFinished(message) => {
                info!(
                    connection = %message.connection,
                    bytes = message.transferred,
                    wire_bytes = message.wire_bytes,
                    "Message received"
                );
                if echo {
                    self.echo_back(message).await;
                }
            }
            other => debug!(?other, "Service event"),
        }
    }

    async fn echo_back(&self, message: ReceivedMessage) {
        let Some(connection) = self.service.connection(&message.connection) else {
            warn!("{} is gone, dropping echo", message.connection);
            return;
        };
        if let Err(e) = connection.send(message.payload).await {
            error!("Echo to {} failed: {}", message.connection, e);
        }
    }

    /// Accumulated statistics as pretty JSON
    pub fn stats_json(&self) -> Result<String> {
        let counters: serde_json::Map<String, serde_json::Value> = self
            .stats
            .snapshot()
            .into_iter()
            .map(|(name, counter)| {
                (
                    name,
                    serde_json::json!({ "count": counter.count, "bytes": counter.bytes }),
                )
            })
            .collect();
        Ok(serde_json::to_string_pretty(&counters)?)
    }

    // ------------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------------

    /// Connect to `to`, send one payload and disconnect
    pub async fn send(&mut self, to: &Endpoint, source: PayloadSource) -> Result<SendReport> {
        let connection = self.service.connect(to.clone()).await?;
        info!("Connected to {} as {}", to, connection.name());

        let result = match source {
            PayloadSource::Text(text) => connection.send(Bytes::from(text)).await,
            PayloadSource::File(path) => Self::send_file(&connection, &path).await,
        };
        let _ = connection.disconnect().await;
        let report = result?;

        info!(
            bytes = report.transferred,
            wire_bytes = report.wire_bytes,
            parts = report.parts,
            "Sent in {:?}",
            report.elapsed
        );
        Ok(report)
    }

    async fn send_file(connection: &Connection, path: &Path) -> tidewire_runtime::Result<SendReport> {
        let file = tokio::fs::File::open(path).await?;
        connection.send_reader(file).await
    }

    // ------------------------------------------------------------------------
    // Echo Check
    // ------------------------------------------------------------------------

    /// Send `rounds` payloads of `size` bytes and verify each echo
    pub async fn echo_check(
        &mut self,
        to: &Endpoint,
        size: usize,
        rounds: u32,
        wait: Duration,
    ) -> Result<EchoSummary> {
        let connection = self.service.connect(to.clone()).await?;
        let payload = Bytes::from(echo_payload(size));
        let started = Instant::now();

        let outcome = self.run_echo_rounds(&connection, &payload, rounds, wait).await;
        let _ = connection.disconnect().await;
        outcome?;

        let summary = EchoSummary {
            rounds,
            bytes_per_round: size,
            total_elapsed: started.elapsed(),
        };
        info!(
            "{} round trips of {} bytes in {:?} ({} receive events)",
            summary.rounds,
            summary.bytes_per_round,
            summary.total_elapsed,
            self.stats.get(names::RECEIVE).count
        );
        Ok(summary)
    }

    async fn run_echo_rounds(
        &mut self,
        connection: &Connection,
        payload: &Bytes,
        rounds: u32,
        wait: Duration,
    ) -> Result<()> {
        for round in 1..=rounds {
            connection.send(payload.clone()).await?;
            let reply = self.next_message(connection.name(), wait).await?;
            if reply.payload != *payload {
                return Err(CliError::EchoMismatch {
                    sent: payload.len(),
                    received: reply.payload.len(),
                });
            }
            debug!(round, bytes = reply.transferred, "Echo verified");
        }
        Ok(())
    }

    async fn next_message(&mut self, connection: &str, wait: Duration) -> Result<ReceivedMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| CliError::PeerTimeout(wait.as_millis() as u64))?;
            match event {
                Some(ServiceEvent::ReceiveFinished(message)) if message.connection == connection => {
                    return Ok(message)
                }
                Some(ServiceEvent::Disconnected { connection: name }) if name == connection => {
                    return Err(tidewire_core::TidewireError::not_connected(name).into())
                }
                Some(ServiceEvent::Exception(fault)) => warn!("{}", fault),
                Some(_) => continue,
                None => return Err(CliError::Config("service event channel closed".to_string())),
            }
        }
    }
}

/// Deterministic payload for echo checks
pub fn echo_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tidewire_core::{CompressionMode, ServiceConfig};

    fn client_config() -> AppConfig {
        AppConfig {
            service: ServiceConfig::testing().with_compression(CompressionMode::GZip),
            ..AppConfig::default()
        }
    }

    fn server_config() -> AppConfig {
        let mut config = client_config();
        config.service.address = Some(Endpoint::parse("tcp://127.0.0.1:0").unwrap());
        config
    }

    #[test]
    fn test_echo_payload_pattern() {
        let payload = echo_payload(600);
        assert_eq!(payload.len(), 600);
        assert_eq!(payload[0], 0);
        assert_eq!(payload[251], 0);
        assert_eq!(payload[252], 1);
    }

    #[tokio::test]
    async fn test_send_text_to_server() {
        let mut server = TidewireApp::new(server_config()).unwrap();
        let endpoint = server.service().start().await.unwrap();

        let mut client = TidewireApp::new(client_config()).unwrap();
        let report = client
            .send(&endpoint, PayloadSource::Text("hello tidewire".to_string()))
            .await
            .unwrap();
        assert_eq!(report.transferred, 14);

        let message = server.next_message_any(Duration::from_secs(5)).await;
        assert_eq!(&message.payload[..], b"hello tidewire");
        server.service().stop_listener().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_file_to_server() {
        let mut server = TidewireApp::new(server_config()).unwrap();
        let endpoint = server.service().start().await.unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), echo_payload(40_000)).unwrap();

        let mut client = TidewireApp::new(client_config()).unwrap();
        let report = client
            .send(&endpoint, PayloadSource::File(file.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(report.transferred, 40_000);

        let message = server.next_message_any(Duration::from_secs(5)).await;
        assert_eq!(message.payload.to_vec(), echo_payload(40_000));
        server.service().stop_listener().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails() {
        let mut client = TidewireApp::new(client_config()).unwrap();
        let endpoint = Endpoint::parse("tcp://127.0.0.1:1").unwrap();
        let err = client
            .send(&endpoint, PayloadSource::Text("x".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Transport(_)));
    }

    impl TidewireApp {
        async fn next_message_any(&mut self, wait: Duration) -> ReceivedMessage {
            tokio::time::timeout(wait, async {
                loop {
                    match self.events.recv().await {
                        Some(ServiceEvent::ReceiveFinished(message)) => return message,
                        Some(_) => continue,
                        None => panic!("event channel closed"),
                    }
                }
            })
            .await
            .expect("no message received")
        }
    }
}
