//! Physical transports
//!
//! A transport is split into a [`TransportWriter`] and a [`TransportReader`]
//! so sends and the receive loop of one connection run concurrently. Each
//! half exposes only the primitives the connection logic needs: writing one
//! part, writing the boundary marker, and loading the next raw chunk.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use tidewire_core::{AddressError, Endpoint, Result, Scheme};

pub mod tcp;
pub mod websocket;

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Outcome of one physical read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPart {
    /// This many bytes were copied into the buffer
    Data(usize),
    /// The peer closed the byte stream
    Eof,
    /// The peer closed the session explicitly, e.g. with a WebSocket Close frame
    Closed(Option<String>),
}

/// Sending half of a physical transport
#[async_trait]
pub trait TransportWriter: Send {
    /// Write one chunk of (possibly compressed) payload
    async fn send_part(&mut self, data: &[u8]) -> Result<()>;

    /// Write the literal boundary marker with minimal delay
    async fn send_boundary_marker(&mut self) -> Result<()>;

    /// Gracefully close the sending direction
    async fn shutdown(&mut self) -> Result<()>;
}

/// Receiving half of a physical transport
#[async_trait]
pub trait TransportReader: Send {
    /// Read the next raw chunk into `buf`
    async fn load_part(&mut self, buf: &mut [u8]) -> Result<LoadPart>;
}

/// Both halves of a freshly established transport
pub struct TransportPair {
    pub writer: Box<dyn TransportWriter>,
    pub reader: Box<dyn TransportReader>,
    pub peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for TransportPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPair")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Connect
// ----------------------------------------------------------------------------

/// Open a client transport to `endpoint`
pub async fn connect(endpoint: &Endpoint) -> Result<TransportPair> {
    endpoint.ensure_streaming()?;
    debug!(address = %endpoint, "Opening transport");
    match endpoint.scheme() {
        Scheme::Tcp => tcp::connect(endpoint).await,
        Scheme::Ws | Scheme::Wss => websocket::connect(endpoint).await,
        other => Err(AddressError::UnsupportedScheme {
            scheme: other.to_string(),
        }
        .into()),
    }
}

// ----------------------------------------------------------------------------
// Listener
// ----------------------------------------------------------------------------

/// A bound listening socket for one streaming scheme
#[derive(Debug)]
pub struct Listener {
    scheme: Scheme,
    inner: TcpListener,
}

impl Listener {
    /// Bind `endpoint` with the given backlog
    pub async fn bind(endpoint: &Endpoint, backlog: u32) -> Result<Self> {
        endpoint.ensure_streaming()?;
        if endpoint.scheme() == Scheme::Wss {
            return Err(AddressError::UnsupportedScheme {
                scheme: "wss (listen)".to_string(),
            }
            .into());
        }

        let addr = endpoint.resolve().await?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let inner = socket.listen(backlog)?;

        debug!(address = %endpoint, backlog, "Listener bound");
        Ok(Self {
            scheme: endpoint.scheme(),
            inner,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Endpoint describing the actually bound address
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::from_socket_addr(self.scheme, self.local_addr()?)?)
    }

    /// Accept the next raw socket
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    /// Turn an accepted socket into a transport, performing the WebSocket
    /// handshake where the scheme needs one
    pub async fn upgrade(scheme: Scheme, stream: TcpStream, peer: SocketAddr) -> Result<TransportPair> {
        match scheme {
            Scheme::Tcp => Ok(tcp::from_stream(stream, Some(peer))),
            Scheme::Ws => websocket::accept(stream, peer).await,
            other => Err(AddressError::UnsupportedScheme {
                scheme: other.to_string(),
            }
            .into()),
        }
    }
}
