//! Command handlers for the tidewire CLI

use std::time::Duration;

use tracing::info;

use crate::app::{PayloadSource, TidewireApp};
use crate::cli::Commands;
use crate::config::parse_endpoint;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(command: Commands, mut app: TidewireApp) -> Result<()> {
        match command {
            Commands::Serve { echo, .. } => app.serve(echo).await,
            Commands::Send { to, file, message } => {
                Self::handle_send_command(&mut app, &to, file, message).await
            }
            Commands::EchoCheck {
                to,
                size,
                rounds,
                wait_ms,
            } => Self::handle_echo_check(&mut app, &to, size, rounds, wait_ms).await,
            Commands::ShowConfig => {
                print!("{}", app.config().to_toml_string()?);
                Ok(())
            }
        }
    }

    /// Handle the send command
    async fn handle_send_command(
        app: &mut TidewireApp,
        to: &str,
        file: Option<std::path::PathBuf>,
        message: Option<String>,
    ) -> Result<()> {
        let endpoint = parse_endpoint(to)?;
        let source = match (file, message) {
            (Some(path), _) => PayloadSource::File(path),
            (None, Some(text)) => PayloadSource::Text(text),
            (None, None) => {
                return Err(CliError::InvalidArgument(
                    "either a message or --file is required".to_string(),
                ))
            }
        };

        let wait = Duration::from_millis(app.config().cli.send_wait_ms);
        let report = tokio::time::timeout(wait, app.send(&endpoint, source))
            .await
            .map_err(|_| CliError::PeerTimeout(wait.as_millis() as u64))??;
        println!(
            "sent {} bytes ({} on the wire) to {}",
            report.transferred, report.wire_bytes, endpoint
        );
        Ok(())
    }

    /// Handle the echo-check command
    async fn handle_echo_check(
        app: &mut TidewireApp,
        to: &str,
        size: usize,
        rounds: u32,
        wait_ms: u64,
    ) -> Result<()> {
        if rounds == 0 {
            return Err(CliError::InvalidArgument("rounds must be at least 1".to_string()));
        }
        let endpoint = parse_endpoint(to)?;
        info!("Running {} echo round(s) of {} bytes against {}", rounds, size, endpoint);

        let summary = app
            .echo_check(&endpoint, size, rounds, Duration::from_millis(wait_ms))
            .await?;
        println!(
            "echo ok: {} x {} bytes in {:?}",
            summary.rounds, summary.bytes_per_round, summary.total_elapsed
        );
        Ok(())
    }
}
