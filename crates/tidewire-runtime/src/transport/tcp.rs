//! Plain TCP transport

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use tidewire_core::{Endpoint, Result, TidewireError, BOUNDARY_MARKER};

use super::{LoadPart, TransportPair, TransportReader, TransportWriter};

/// Connect to a `tcp://` endpoint
pub async fn connect(endpoint: &Endpoint) -> Result<TransportPair> {
    let addr = endpoint.resolve().await?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TidewireError::connection_failed(endpoint.as_str(), e.to_string()))?;
    Ok(from_stream(stream, Some(addr)))
}

/// Split a connected socket into transport halves
pub fn from_stream(stream: TcpStream, peer_addr: Option<SocketAddr>) -> TransportPair {
    let (read, write) = stream.into_split();
    TransportPair {
        writer: Box::new(TcpWriter { inner: write }),
        reader: Box::new(TcpReader { inner: read }),
        peer_addr,
    }
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

struct TcpWriter {
    inner: OwnedWriteHalf,
}

#[async_trait]
impl TransportWriter for TcpWriter {
    async fn send_part(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    async fn send_boundary_marker(&mut self) -> Result<()> {
        self.inner.as_ref().set_nodelay(true)?;
        let written = match self.inner.write_all(&BOUNDARY_MARKER).await {
            Ok(()) => self.inner.flush().await,
            Err(e) => Err(e),
        };
        // Restore Nagle for the next payload even if the write failed
        if let Err(e) = self.inner.as_ref().set_nodelay(false) {
            trace!(error = %e, "Could not re-enable Nagle");
        }
        written?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self.inner.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------------

struct TcpReader {
    inner: OwnedReadHalf,
}

#[async_trait]
impl TransportReader for TcpReader {
    async fn load_part(&mut self, buf: &mut [u8]) -> Result<LoadPart> {
        match self.inner.read(buf).await {
            Ok(0) => Ok(LoadPart::Eof),
            Ok(n) => Ok(LoadPart::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                Ok(LoadPart::Closed(Some(e.to_string())))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
