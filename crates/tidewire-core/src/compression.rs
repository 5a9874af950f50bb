//! Payload compression adapters
//!
//! Compression wraps the application-facing side of a pipe: the send path
//! compresses into the pipe, the receive path decompresses out of it. The
//! boundary marker is written by the transport after the compressed bytes and
//! never passes through these adapters.

use std::io;

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder};
use async_compression::tokio::write::{BrotliEncoder, GzipEncoder};
use async_compression::Level;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Boxed application-side writer
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed application-side reader
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ----------------------------------------------------------------------------
// Compression Settings
// ----------------------------------------------------------------------------

/// Compression applied to every logical payload of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Payload bytes travel as-is
    None,
    /// RFC 1952 gzip stream
    GZip,
    /// Brotli stream
    #[default]
    Brotli,
}

impl CompressionMode {
    /// Whether any compression is applied
    pub fn is_enabled(self) -> bool {
        !matches!(self, CompressionMode::None)
    }

    /// Short lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionMode::None => "none",
            CompressionMode::GZip => "gzip",
            CompressionMode::Brotli => "brotli",
        }
    }
}

impl core::str::FromStr for CompressionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(CompressionMode::None),
            "gzip" => Ok(CompressionMode::GZip),
            "brotli" | "br" => Ok(CompressionMode::Brotli),
            other => Err(format!("unknown compression mode '{}'", other)),
        }
    }
}

/// Speed/ratio trade-off for the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Favour latency; the default for streaming traffic
    #[default]
    Fastest,
    /// Codec default
    Default,
    /// Favour ratio
    Best,
}

impl CompressionLevel {
    fn level(self) -> Level {
        match self {
            CompressionLevel::Fastest => Level::Fastest,
            CompressionLevel::Default => Level::Default,
            CompressionLevel::Best => Level::Best,
        }
    }
}

// ----------------------------------------------------------------------------
// Stream Adapters
// ----------------------------------------------------------------------------

/// Wrap `inner` so that bytes written are compressed before reaching it.
///
/// The returned writer must be shut down to flush the codec trailer.
pub fn compress_writer<W>(mode: CompressionMode, level: CompressionLevel, inner: W) -> BoxedWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    match mode {
        CompressionMode::None => Box::new(inner),
        CompressionMode::GZip => Box::new(GzipEncoder::with_quality(inner, level.level())),
        CompressionMode::Brotli => Box::new(BrotliEncoder::with_quality(inner, level.level())),
    }
}

/// Wrap `inner` so that bytes read from it are decompressed
pub fn decompress_reader<R>(mode: CompressionMode, inner: R) -> BoxedReader
where
    R: AsyncRead + Send + Unpin + 'static,
{
    match mode {
        CompressionMode::None => Box::new(inner),
        CompressionMode::GZip => Box::new(GzipDecoder::new(BufReader::new(inner))),
        CompressionMode::Brotli => Box::new(BrotliDecoder::new(BufReader::new(inner))),
    }
}

/// Compress a complete buffer
pub async fn compress(mode: CompressionMode, level: CompressionLevel, data: &[u8]) -> io::Result<Vec<u8>> {
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::GZip => {
            let mut encoder = GzipEncoder::with_quality(Vec::new(), level.level());
            encoder.write_all(data).await?;
            encoder.shutdown().await?;
            Ok(encoder.into_inner())
        }
        CompressionMode::Brotli => {
            let mut encoder = BrotliEncoder::with_quality(Vec::new(), level.level());
            encoder.write_all(data).await?;
            encoder.shutdown().await?;
            Ok(encoder.into_inner())
        }
    }
}

/// Decompress a complete buffer
pub async fn decompress(mode: CompressionMode, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut reader = decompress_reader(mode, io::Cursor::new(data.to_vec()));
    reader.read_to_end(&mut out).await?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_each_mode() {
        let payload = vec![0x41u8; 5001];
        for mode in [CompressionMode::None, CompressionMode::GZip, CompressionMode::Brotli] {
            let packed = compress(mode, CompressionLevel::Fastest, &payload).await.unwrap();
            if mode.is_enabled() {
                assert!(packed.len() < payload.len(), "{:?} should shrink repetitive data", mode);
            }
            let unpacked = decompress(mode, &packed).await.unwrap();
            assert_eq!(unpacked, payload);
        }
    }

    #[tokio::test]
    async fn test_empty_payload() {
        for mode in [CompressionMode::None, CompressionMode::GZip, CompressionMode::Brotli] {
            let packed = compress(mode, CompressionLevel::Default, &[]).await.unwrap();
            assert!(decompress(mode, &packed).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_corrupt_gzip_fails() {
        let err = decompress(CompressionMode::GZip, b"definitely not gzip").await;
        assert!(err.is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("GZip".parse::<CompressionMode>().unwrap(), CompressionMode::GZip);
        assert_eq!("br".parse::<CompressionMode>().unwrap(), CompressionMode::Brotli);
        assert_eq!("none".parse::<CompressionMode>().unwrap(), CompressionMode::None);
        assert!("lz4".parse::<CompressionMode>().is_err());
        assert_eq!(CompressionMode::default(), CompressionMode::Brotli);
    }
}
