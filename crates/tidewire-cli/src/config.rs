//! Tidewire CLI Configuration Management
//!
//! Configuration is layered with the priority CLI flags > config file >
//! defaults. The file is TOML with a `[service]` table holding a
//! [`ServiceConfig`] and a `[cli]` table for front-end settings.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tidewire_core::{CompressionMode, Endpoint, ServiceConfig};
use tracing::debug;

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the tidewire CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Transport service configuration
    pub service: ServiceConfig,

    /// CLI-specific configuration
    pub cli: CliConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,

    /// How long `send` waits for the transfer to be reported, in milliseconds
    pub send_wait_ms: u64,

    /// Print final statistics as JSON when `serve` stops
    pub print_stats: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            send_wait_ms: 30_000,
            print_stats: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Resolve the effective configuration for a command line: the file named
    /// by `--config` (or defaults), then the flag overrides
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load_from_file(path)
                .with_context(|| format!("loading configuration file {}", path.display()))?,
            None => Self::default(),
        };
        config
            .apply_overrides(cli)
            .context("applying command line overrides")?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply command line overrides on top of the loaded values
    pub fn apply_overrides(&mut self, cli: &Cli) -> Result<()> {
        if cli.verbose {
            self.cli.verbose = true;
        }
        if let Some(mode) = cli.compression {
            self.service.compression = mode;
        }
        if let Some(ms) = cli.transfer_timeout_ms {
            self.service.transfer_timeout = Duration::from_millis(ms);
        }
        if let Commands::Serve {
            listen,
            idle_timeout_ms,
            ..
        } = &cli.command
        {
            if let Some(listen) = listen {
                self.service.address = Some(parse_endpoint(listen)?);
            }
            if let Some(ms) = idle_timeout_ms {
                self.service = self
                    .service
                    .clone()
                    .with_connection_timeout(Duration::from_millis(*ms));
            }
        }
        debug!(
            compression = self.service.compression.as_str(),
            transfer_timeout_ms = self.service.transfer_timeout.as_millis() as u64,
            "Applied command line overrides"
        );
        self.validate()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        if self.cli.send_wait_ms == 0 {
            return Err(CliError::Config("cli.send_wait_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Compression applied by the service
    pub fn compression(&self) -> CompressionMode {
        self.service.compression
    }
}

/// Parse an address argument into an endpoint
pub fn parse_endpoint(input: &str) -> Result<Endpoint> {
    Endpoint::parse(input).map_err(|e| CliError::InvalidArgument(format!("{}: {}", input, e)))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
