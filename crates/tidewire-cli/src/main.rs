//! Tidewire CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use tidewire_cli::{app::TidewireApp, cli::Cli, commands::CommandDispatcher, config::AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration, then let flags override it
    let config = AppConfig::resolve(&cli)?;

    // Initialize logging
    setup_logging(config.cli.verbose);

    let app = TidewireApp::new(config).context("starting the transport service")?;

    if let Err(e) = CommandDispatcher::execute(cli.command, app).await {
        error!("Command execution failed: {}", e);
        std::process::exit(1);
    }

    info!("tidewire exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
