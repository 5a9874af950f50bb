//! Error handling for the tidewire CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Transport error: {0}")]
    Transport(#[from] tidewire_core::TidewireError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Echo mismatch: sent {sent} bytes, got {received} bytes back")]
    EchoMismatch { sent: usize, received: usize },

    #[error("Timed out after {0} ms waiting for the peer")]
    PeerTimeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML rendering error: {0}")]
    TomlRendering(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<tidewire_core::ConfigError> for CliError {
    fn from(err: tidewire_core::ConfigError) -> Self {
        CliError::Config(err.to_string())
    }
}
