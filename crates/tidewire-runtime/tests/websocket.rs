//! Transfers over the WebSocket transport

mod common;

use tidewire_runtime::{
    CompressionMode, Endpoint, Service, ServiceConfig, ServiceEvent,
};

use common::*;

#[tokio::test]
async fn test_websocket_round_trip_both_directions() {
    let config = ServiceConfig::testing().with_compression(CompressionMode::Brotli);
    let (mut server, endpoint) = server("ws", config.clone()).await;
    let (mut client, connection) = client(&endpoint, config).await;

    let payload = vec![0x41u8; 5001];
    connection.send(payload.clone()).await.unwrap();
    let message = expect_received(&mut server.events).await;
    assert_eq!(message.transferred, 5001);
    assert_eq!(message.payload.as_ref(), payload.as_slice());

    let peer = server.service.connection(&message.connection).unwrap();
    peer.send(&b"ack"[..]).await.unwrap();
    let reply = expect_received(&mut client.events).await;
    assert_eq!(reply.payload.as_ref(), b"ack");
}

#[tokio::test]
async fn test_websocket_close_disconnects_peer() {
    let (mut server, endpoint) = server("ws", ServiceConfig::testing()).await;
    let (_client, connection) = client(&endpoint, ServiceConfig::testing()).await;
    let name = expect_connected(&mut server.events).await;

    connection.disconnect().await.unwrap();
    let gone = expect_event(&mut server.events, |e| {
        matches!(e, ServiceEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(gone, ServiceEvent::Disconnected { connection: name });
}

#[tokio::test]
async fn test_secure_websocket_listen_is_unsupported() {
    let config =
        ServiceConfig::testing().with_address(Endpoint::parse("wss://127.0.0.1:0").unwrap());
    let service = Service::new(config).unwrap();
    assert!(service.start().await.is_err());
    assert!(!service.is_online());
}
