//! WebSocket transport
//!
//! Every part and every boundary marker travels as one binary frame. The
//! receiving side flattens frames back into a byte stream, so framing on the
//! wire stays identical to TCP from the scanner's point of view.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::trace;

use tidewire_core::{Endpoint, Result, TidewireError, BOUNDARY_MARKER};

use super::{LoadPart, TransportPair, TransportReader, TransportWriter};

fn ws_error(e: WsError) -> TidewireError {
    TidewireError::websocket(e.to_string())
}

/// Connect to a `ws://` (or, with the `tls` feature, `wss://`) endpoint
pub async fn connect(endpoint: &Endpoint) -> Result<TransportPair> {
    let (stream, _response) = connect_async_with_config(endpoint.as_str(), None, true)
        .await
        .map_err(|e| TidewireError::connection_failed(endpoint.as_str(), e.to_string()))?;
    let peer_addr = match stream.get_ref() {
        MaybeTlsStream::Plain(socket) => socket.peer_addr().ok(),
        _ => None,
    };
    Ok(split(stream, peer_addr))
}

/// Complete the server-side handshake on an accepted socket
pub async fn accept(stream: TcpStream, peer: SocketAddr) -> Result<TransportPair> {
    stream.set_nodelay(true)?;
    let ws = accept_async(stream)
        .await
        .map_err(|e| TidewireError::websocket(format!("handshake with {} failed: {}", peer, e)))?;
    Ok(split(ws, Some(peer)))
}

fn split<S>(ws: WebSocketStream<S>, peer_addr: Option<SocketAddr>) -> TransportPair
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    TransportPair {
        writer: Box::new(WsWriter { sink }),
        reader: Box::new(WsReader {
            stream,
            pending: Bytes::new(),
        }),
        peer_addr,
    }
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> TransportWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_part(&mut self, data: &[u8]) -> Result<()> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(ws_error)
    }

    async fn send_boundary_marker(&mut self) -> Result<()> {
        self.sink
            .send(Message::Binary(BOUNDARY_MARKER.to_vec()))
            .await
            .map_err(ws_error)
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_error(e)),
        }
    }
}

// ----------------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------------

struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    /// Unread remainder of the last frame
    pending: Bytes,
}

#[async_trait]
impl<S> TransportReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn load_part(&mut self, buf: &mut [u8]) -> Result<LoadPart> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Ok(LoadPart::Data(n));
            }

            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => self.pending = Bytes::from(data),
                Some(Ok(Message::Text(text))) => self.pending = Bytes::from(text.into_bytes()),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason));
                    trace!(?reason, "Close frame received");
                    return Ok(LoadPart::Closed(reason));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Ok(LoadPart::Eof)
                }
                Some(Err(e)) => return Err(ws_error(e)),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TransportPair, TransportPair) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            accept(stream, peer).await.unwrap()
        });
        let client = connect(&endpoint).await.unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_frames_flatten_into_byte_stream() {
        let (mut client, mut server) = pair().await;

        client.writer.send_part(b"0123456789").await.unwrap();
        client.writer.send_boundary_marker().await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 3];
        while received.len() < 10 + BOUNDARY_MARKER.len() {
            match server.reader.load_part(&mut buf).await.unwrap() {
                LoadPart::Data(n) => received.extend_from_slice(&buf[..n]),
                other => panic!("unexpected {:?}", other),
            }
        }

        let mut expected = b"0123456789".to_vec();
        expected.extend_from_slice(&BOUNDARY_MARKER);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_close_frame_is_not_plain_eof() {
        let (mut client, mut server) = pair().await;
        client.writer.shutdown().await.unwrap();

        let mut buf = [0u8; 16];
        let loaded = server.reader.load_part(&mut buf).await.unwrap();
        assert!(matches!(loaded, LoadPart::Closed(_)));
    }
}
