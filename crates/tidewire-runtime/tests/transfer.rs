//! End-to-end transfer tests over TCP
//!
//! Every test runs a listening service and a client service in the same
//! process and observes both through channel handlers.

mod common;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use tidewire_core::{compression, contains_marker, TransferError, BOUNDARY_MARKER};
use tidewire_runtime::{
    BincodeCodec, CompressionLevel, CompressionMode, ErrorCategory, ServiceConfig, ServiceEvent,
    TidewireError,
};

use common::*;

fn config(mode: CompressionMode) -> ServiceConfig {
    ServiceConfig::testing().with_compression(mode)
}

// ----------------------------------------------------------------------------
// Round Trips
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_end_to_end_brotli_5001_bytes() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::Brotli)).await;
    let (mut client, connection) = client(&endpoint, config(CompressionMode::Brotli)).await;

    let payload = vec![0x41u8; 5001];
    let report = connection.send(payload.clone()).await.unwrap();
    assert_eq!(report.transferred, 5001);
    assert!(report.wire_bytes < 5001);

    let message = expect_received(&mut server.events).await;
    assert_eq!(message.transferred, 5001);
    assert_eq!(message.payload.as_ref(), payload.as_slice());
    assert_eq!(message.wire_bytes, report.wire_bytes);

    let sent = expect_sent(&mut client.events).await;
    assert_eq!(sent, report);
}

#[tokio::test]
async fn test_payload_sizes_round_trip_in_order() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::GZip)).await;
    let (_client, connection) = client(&endpoint, config(CompressionMode::GZip)).await;

    // Empty, single byte, over the compression threshold, over the buffer size
    let sizes = [0usize, 1, 1500, 20_000];
    for size in sizes {
        let payload: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
        connection.send(payload).await.unwrap();
    }

    for size in sizes {
        let message = expect_received(&mut server.events).await;
        assert_eq!(message.payload.len(), size);
        let expected: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
        assert_eq!(message.payload.as_ref(), expected.as_slice());
    }
}

#[tokio::test]
async fn test_back_to_back_messages_keep_fifo_order() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::None)).await;
    let (_client, connection) = client(&endpoint, config(CompressionMode::None)).await;

    for i in 0..25u32 {
        connection.send(format!("message-{}", i)).await.unwrap();
    }
    for i in 0..25u32 {
        let message = expect_received(&mut server.events).await;
        assert_eq!(message.payload, format!("message-{}", i).into_bytes());
    }
}

#[tokio::test]
async fn test_duplex_reply_on_same_connection() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::Brotli)).await;
    let (mut client, connection) = client(&endpoint, config(CompressionMode::Brotli)).await;

    connection.send(&b"ping"[..]).await.unwrap();
    let request = expect_received(&mut server.events).await;
    assert_eq!(request.payload.as_ref(), b"ping");

    let peer = server.service.connection(&request.connection).unwrap();
    peer.send(&b"pong"[..]).await.unwrap();

    let reply = expect_received(&mut client.events).await;
    assert_eq!(reply.payload.as_ref(), b"pong");
    assert_eq!(reply.connection, connection.name());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    symbol: String,
    quantities: Vec<u32>,
}

#[tokio::test]
async fn test_typed_send_streams_through_codec() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::GZip)).await;
    let (_client, connection) = client(&endpoint, config(CompressionMode::GZip)).await;

    let order = Order {
        id: 42,
        symbol: "TIDE".to_string(),
        quantities: (0..10_000).collect(),
    };
    let codec = Arc::new(BincodeCodec);
    let report = connection
        .send_typed(order.clone(), Arc::clone(&codec))
        .await
        .unwrap();

    let message = expect_received(&mut server.events).await;
    assert_eq!(message.transferred, report.transferred);
    let decoded: Order = message.decode(codec.as_ref()).unwrap();
    assert_eq!(decoded, order);
}

/// Fails as soon as the codec asks for its contents
struct Unencodable;

impl Serialize for Unencodable {
    fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("ledger entry cannot be encoded"))
    }
}

#[tokio::test]
async fn test_typed_send_reports_encoder_failure() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::None)).await;
    let (mut client, connection) = client(&endpoint, config(CompressionMode::None)).await;

    let err = connection
        .send_typed(Unencodable, Arc::new(BincodeCodec))
        .await
        .unwrap_err();
    match &err {
        TidewireError::Transfer(TransferError::Aborted { reason }) => {
            assert!(reason.contains("ledger entry cannot be encoded"), "{}", reason)
        }
        other => panic!("unexpected send error: {}", other),
    }
    assert_eq!(connection.snapshot().send_errors, 1);
    assert_eq!(connection.snapshot().send_count, 0);

    let fault = expect_fault(&mut client.events).await;
    assert_eq!(fault.category, ErrorCategory::Transfer);
    assert_eq!(fault.connection.as_deref(), Some(connection.name()));

    // Nothing reached the wire, so the next send goes out normally
    assert!(connection.is_connected());
    connection.send("after").await.unwrap();
    let message = expect_received(&mut server.events).await;
    assert_eq!(message.payload.as_ref(), b"after");
}

// ----------------------------------------------------------------------------
// Exclusivity
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_sends_do_not_interleave() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::None)).await;
    let (_client, connection) = client(&endpoint, config(CompressionMode::None)).await;

    let first = connection.clone();
    let second = connection.clone();
    let (a, b) = tokio::join!(
        first.send(vec![b'a'; 60_000]),
        second.send(vec![b'b'; 60_000]),
    );
    a.unwrap();
    b.unwrap();

    for _ in 0..2 {
        let message = expect_received(&mut server.events).await;
        assert_eq!(message.payload.len(), 60_000);
        let first_byte = message.payload[0];
        assert!(message.payload.iter().all(|&byte| byte == first_byte));
    }
    assert_eq!(connection.snapshot().send_count, 2);
}

// ----------------------------------------------------------------------------
// Raw Wire Behaviour
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_marker_split_across_tiny_reads() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::None)).await;
    let mut raw = TcpStream::connect(endpoint.resolve().await.unwrap())
        .await
        .unwrap();
    raw.set_nodelay(true).unwrap();

    let mut wire = b"split across many reads".to_vec();
    wire.extend_from_slice(&BOUNDARY_MARKER);
    wire.extend_from_slice(b"second");
    wire.extend_from_slice(&BOUNDARY_MARKER);
    for byte in wire {
        raw.write_all(&[byte]).await.unwrap();
        tokio::task::yield_now().await;
    }

    assert_eq!(
        expect_received(&mut server.events).await.payload.as_ref(),
        b"split across many reads"
    );
    assert_eq!(
        expect_received(&mut server.events).await.payload.as_ref(),
        b"second"
    );
}

#[tokio::test]
async fn test_undecodable_message_does_not_break_framing() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::GZip)).await;
    let mut raw = TcpStream::connect(endpoint.resolve().await.unwrap())
        .await
        .unwrap();

    let valid = compression::compress(CompressionMode::GZip, CompressionLevel::Fastest, b"intact")
        .await
        .unwrap();
    let mut wire = b"definitely not gzip".to_vec();
    wire.extend_from_slice(&BOUNDARY_MARKER);
    wire.extend_from_slice(&valid);
    wire.extend_from_slice(&BOUNDARY_MARKER);
    raw.write_all(&wire).await.unwrap();

    let fault = expect_fault(&mut server.events).await;
    assert_eq!(fault.category, ErrorCategory::Protocol);

    let message = expect_received(&mut server.events).await;
    assert_eq!(message.payload.as_ref(), b"intact");
}

#[tokio::test]
async fn test_pipes_are_reused_across_messages() {
    let (mut server, endpoint) = server("tcp", config(CompressionMode::Brotli)).await;
    let (client, connection) = client(&endpoint, config(CompressionMode::Brotli)).await;

    for _ in 0..5 {
        connection.send(vec![7u8; 3000]).await.unwrap();
        expect_received(&mut server.events).await;
    }

    let client_pool = client.service.pool_stats();
    assert_eq!(client_pool.created, 1);
    assert_eq!(client_pool.reused, 4);
    assert_eq!(client_pool.rejected, 0);
    assert!(server.service.pool_stats().reused >= 4);
}

// ----------------------------------------------------------------------------
// Marker Inside the Payload
// ----------------------------------------------------------------------------

/// Incompressible bytes from a fixed xorshift sequence
fn noise(len: usize, mut state: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

fn payload_with_marker() -> Vec<u8> {
    let mut payload = noise(4000, 0x9E37_79B9_7F4A_7C15);
    payload.extend_from_slice(&BOUNDARY_MARKER);
    payload.extend_from_slice(&noise(4000, 0xD1B5_4A32_D192_ED03));
    payload
}

/// A send whose wire bytes carry the marker must fail instead of splitting
/// the message; when compression hides the marker the payload arrives intact.
async fn assert_marker_never_splits_message(mode: CompressionMode) {
    let (mut server, endpoint) = server("tcp", config(mode)).await;
    let (mut client, connection) = client(&endpoint, config(mode)).await;

    let payload = payload_with_marker();
    assert!(contains_marker(&payload));

    match connection.send(payload.clone()).await {
        Err(TidewireError::Transfer(TransferError::MarkerInPayload { offset })) => {
            assert!(offset > 0);
            assert_eq!(connection.snapshot().send_errors, 1);
            let fault = expect_fault(&mut client.events).await;
            assert_eq!(fault.category, ErrorCategory::Transfer);
            assert!(fault.message.contains("boundary marker"));
        }
        Ok(report) => {
            assert_ne!(mode, CompressionMode::None, "raw marker went out unnoticed");
            assert_eq!(report.transferred, payload.len() as u64);
            let message = expect_received(&mut server.events).await;
            assert_eq!(message.payload.as_ref(), payload.as_slice());
        }
        Err(other) => panic!("unexpected send error: {}", other),
    }

    // The connection stays usable and framing is back in sync
    assert!(connection.is_connected());
    connection.send("after").await.unwrap();
    expect_event(&mut server.events, |event| {
        matches!(event, ServiceEvent::ReceiveFinished(message) if message.payload.as_ref() == b"after")
    })
    .await;
}

#[tokio::test]
async fn test_marker_in_raw_payload_fails_send() {
    assert_marker_never_splits_message(CompressionMode::None).await;
}

#[tokio::test]
async fn test_marker_in_gzip_stored_block_is_caught() {
    assert_marker_never_splits_message(CompressionMode::GZip).await;
}

#[tokio::test]
async fn test_marker_in_brotli_uncompressed_block_is_caught() {
    assert_marker_never_splits_message(CompressionMode::Brotli).await;
}
