//! Shared helpers for the runtime integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use tidewire_runtime::{
    ChannelHandler, Connection, Endpoint, ReceivedMessage, SendReport, Service, ServiceConfig,
    ServiceEvent, ServiceFault,
};

pub const EVENT_WAIT: Duration = Duration::from_secs(5);

pub type Events = UnboundedReceiver<ServiceEvent>;

/// A service wired to a channel handler
pub struct Node {
    pub service: Service,
    pub events: Events,
}

pub fn node(config: ServiceConfig) -> Node {
    let (handler, events) = ChannelHandler::new();
    let service = Service::builder(config)
        .with_handler(Arc::new(handler))
        .build()
        .unwrap();
    Node { service, events }
}

/// Start a listening node on an ephemeral port of `scheme`
pub async fn server(scheme: &str, config: ServiceConfig) -> (Node, Endpoint) {
    let address = Endpoint::parse(&format!("{}://127.0.0.1:0", scheme)).unwrap();
    let node = node(config.with_address(address));
    let endpoint = node.service.start().await.unwrap();
    (node, endpoint)
}

/// Connect a fresh client node to `endpoint`
pub async fn client(endpoint: &Endpoint, config: ServiceConfig) -> (Node, Connection) {
    let node = node(config);
    let connection = node.service.connect(endpoint.clone()).await.unwrap();
    (node, connection)
}

/// Wait for the first event matching `pred`, skipping others
pub async fn expect_event<F>(events: &mut Events, mut pred: F) -> ServiceEvent
where
    F: FnMut(&ServiceEvent) -> bool,
{
    timeout(EVENT_WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn expect_received(events: &mut Events) -> ReceivedMessage {
    match expect_event(events, |e| matches!(e, ServiceEvent::ReceiveFinished(_))).await {
        ServiceEvent::ReceiveFinished(message) => message,
        _ => unreachable!(),
    }
}

pub async fn expect_sent(events: &mut Events) -> SendReport {
    match expect_event(events, |e| matches!(e, ServiceEvent::SendFinished(_))).await {
        ServiceEvent::SendFinished(report) => report,
        _ => unreachable!(),
    }
}

pub async fn expect_fault(events: &mut Events) -> ServiceFault {
    match expect_event(events, |e| matches!(e, ServiceEvent::Exception(_))).await {
        ServiceEvent::Exception(fault) => fault,
        _ => unreachable!(),
    }
}

/// Name of the next connection the service registers
pub async fn expect_connected(events: &mut Events) -> String {
    match expect_event(events, |e| matches!(e, ServiceEvent::Connected { .. })).await {
        ServiceEvent::Connected { connection } => connection,
        _ => unreachable!(),
    }
}

/// Poll `check` until it holds or the wait expires
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
