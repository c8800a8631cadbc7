//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use blip::{
    CloseStatus,
    Connection,
    ConnectionDelegate,
    MessageIn,
    Transport,
    TransportEvent,
    TransportEvents,
    loopback_pair,
};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Everything a delegate can observe, forwarded over a channel so tests
/// can await it.
#[derive(Debug)]
pub enum DelegateEvent {
    Connect,
    Close(CloseStatus),
    Request(Arc<MessageIn>),
    Response(Arc<MessageIn>),
}

pub struct ForwardingDelegate {
    tx: mpsc::UnboundedSender<DelegateEvent>,
}

#[must_use]
pub fn forwarding_delegate() -> (ForwardingDelegate, mpsc::UnboundedReceiver<DelegateEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ForwardingDelegate { tx }, rx)
}

impl ConnectionDelegate for ForwardingDelegate {
    fn on_connect(&mut self) {
        let _ = self.tx.send(DelegateEvent::Connect);
    }

    fn on_close(&mut self, status: CloseStatus) {
        let _ = self.tx.send(DelegateEvent::Close(status));
    }

    fn on_request_received(&mut self, request: Arc<MessageIn>) {
        let _ = self.tx.send(DelegateEvent::Request(request));
    }

    fn on_response_received(&mut self, response: Arc<MessageIn>) {
        let _ = self.tx.send(DelegateEvent::Response(response));
    }
}

/// A delegate keeping every default; unhandled requests get `BLIP`/404.
pub struct DefaultDelegate;

impl ConnectionDelegate for DefaultDelegate {}

/// Two connections wired to each other in-process.
#[must_use]
pub fn connected_pair() -> (Connection, Connection) {
    let ((a_end, a_events), (b_end, b_events)) = loopback_pair();
    (
        Connection::new(a_end, a_events, DefaultDelegate),
        Connection::new(b_end, b_events, DefaultDelegate),
    )
}

/// Await `future`, failing the test after five seconds.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting on the connection")
}

/// A transport with no peer: frames vanish, close is acknowledged.
pub struct BlackholeTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    open: bool,
}

#[must_use]
pub fn blackhole() -> (BlackholeTransport, TransportEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        BlackholeTransport {
            events: tx,
            open: true,
        },
        rx,
    )
}

impl Transport for BlackholeTransport {
    fn send(&mut self, _frame: Bytes) {}

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let _ = self
                .events
                .send(TransportEvent::Closed(CloseStatus::normal()));
        }
    }
}
