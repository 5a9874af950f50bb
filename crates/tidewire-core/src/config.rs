//! Service Configuration
//!
//! One [`ServiceConfig`] describes a listening or client-side service: where
//! it binds, how large its transfer buffers are, how long a stalled transfer
//! may wait, how often idle connections are swept and which compression is
//! applied. Durations are stored in milliseconds when serialized so the
//! struct round-trips through TOML.

use core::time::Duration;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::Endpoint;
use crate::boundary::MARKER_LEN;
use crate::compression::{CompressionLevel, CompressionMode};
use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

/// Default transfer buffer size (16 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default sliding transfer timeout
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default pipe capacity (four transfer buffers)
pub const DEFAULT_PIPE_CAPACITY: usize = 4 * DEFAULT_BUFFER_SIZE;

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 128;

/// Default number of idle pipes kept by the pool
pub const DEFAULT_MAX_POOLED_PIPES: usize = 64;

// ----------------------------------------------------------------------------
// Service Configuration
// ----------------------------------------------------------------------------

/// Configuration for one transport service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listen (or default connect) address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Endpoint>,
    /// Size of one transport read or write
    pub buffer_size: usize,
    /// Bytes a pipe buffers before its writer waits
    pub pipe_capacity: usize,
    /// Sliding per-chunk transfer timeout; zero disables it
    #[serde(rename = "transfer_timeout_ms", with = "millis")]
    pub transfer_timeout: Duration,
    /// Idle-sweep period; `None` disables the sweep
    #[serde(
        rename = "connection_timeout_ms",
        with = "opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_timeout: Option<Duration>,
    /// Compression applied to every payload
    pub compression: CompressionMode,
    /// Encoder speed/ratio trade-off
    pub compression_level: CompressionLevel,
    /// Listen backlog
    pub backlog: u32,
    /// Idle pipes kept for reuse
    pub max_pooled_pipes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            address: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            connection_timeout: None,
            compression: CompressionMode::default(),
            compression_level: CompressionLevel::default(),
            backlog: DEFAULT_BACKLOG,
            max_pooled_pipes: DEFAULT_MAX_POOLED_PIPES,
        }
    }
}

impl ServiceConfig {
    /// Default configuration bound to `address`
    pub fn new(address: Endpoint) -> Self {
        Self {
            address: Some(address),
            ..Self::default()
        }
    }

    /// Configuration for tests: short timeouts and small buffers
    pub fn testing() -> Self {
        Self {
            buffer_size: 1024,
            pipe_capacity: 4096,
            transfer_timeout: Duration::from_secs(2),
            max_pooled_pipes: 8,
            ..Self::default()
        }
    }

    /// Configuration favouring latency over bandwidth
    pub fn low_latency() -> Self {
        Self {
            buffer_size: 4 * 1024,
            pipe_capacity: 16 * 1024,
            compression: CompressionMode::None,
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: Endpoint) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_pipe_capacity(mut self, pipe_capacity: usize) -> Self {
        self.pipe_capacity = pipe_capacity;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Enable the idle sweep with the given period; zero disables it
    pub fn with_connection_timeout(mut self, period: Duration) -> Self {
        self.connection_timeout = if period.is_zero() { None } else { Some(period) };
        self
    }

    pub fn with_compression(mut self, compression: CompressionMode) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_compression_level(mut self, level: CompressionLevel) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Idle-sweep period, treating zero as disabled
    pub fn sweep_period(&self) -> Option<Duration> {
        self.connection_timeout.filter(|period| !period.is_zero())
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MARKER_LEN {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: format!("must be at least {} bytes", MARKER_LEN),
            });
        }
        if self.pipe_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "pipe_capacity",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.backlog == 0 {
            return Err(ConfigError::Invalid {
                field: "backlog",
                reason: "must be non-zero".to_string(),
            });
        }
        if let Some(address) = &self.address {
            address.ensure_streaming().map_err(|e| ConfigError::Invalid {
                field: "address",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Parse from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML text
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Load from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
            field: "path",
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&text)
    }
}

// ----------------------------------------------------------------------------
// Duration Serialization
// ----------------------------------------------------------------------------

mod millis {
    use core::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use core::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.buffer_size, 16 * 1024);
        assert_eq!(config.transfer_timeout, Duration::from_millis(10_000));
        assert_eq!(config.compression, CompressionMode::Brotli);
        assert!(config.sweep_period().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ServiceConfig::new(Endpoint::parse("tcp://127.0.0.1:7000").unwrap())
            .with_connection_timeout(Duration::from_secs(30))
            .with_compression(CompressionMode::GZip);
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("transfer_timeout_ms = 10000"));
        assert_eq!(ServiceConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ServiceConfig::from_toml_str(
            r#"
            address = "ws://0.0.0.0:8080"
            compression = "none"
            connection_timeout_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.compression, CompressionMode::None);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.connection_timeout.is_none());
    }

    #[test]
    fn test_validation_failures() {
        assert!(ServiceConfig::default().with_buffer_size(4).validate().is_err());
        assert!(ServiceConfig::default().with_backlog(0).validate().is_err());

        let udp = ServiceConfig::new(Endpoint::parse("udp://127.0.0.1:53").unwrap());
        assert!(matches!(
            udp.validate(),
            Err(ConfigError::Invalid { field: "address", .. })
        ));
    }
}
