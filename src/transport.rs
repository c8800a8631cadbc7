//! The transport seam beneath a connection.
//!
//! The engine never opens sockets itself. It owns a [`Transport`] for
//! writing and consumes a stream of [`TransportEvent`]s for everything the
//! socket reports: connection establishment, incoming messages, room to
//! write, and closure. Any WebSocket client or server implementation can
//! drive a connection by implementing the trait and feeding the event
//! channel.
//!
//! [`loopback_pair`] wires two halves directly to each other for
//! in-process peers, which is how the integration tests (and simple demos)
//! run two engines against real wire bytes without a network.

use bytes::Bytes;
use tokio::sync::mpsc;

/// How and why the transport closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseStatus {
    /// Whether the close was a clean, mutually acknowledged shutdown.
    pub normal: bool,
    /// WebSocket close code.
    pub code: u16,
    /// Close reason phrase, possibly empty.
    pub reason: String,
}

impl CloseStatus {
    /// A normal closure (code 1000).
    #[must_use]
    pub fn normal() -> Self {
        Self {
            normal: true,
            code: 1000,
            reason: String::new(),
        }
    }

    /// The abnormal-closure status used when a transport vanishes without
    /// a close handshake (code 1006).
    #[must_use]
    pub fn dropped() -> Self {
        Self {
            normal: false,
            code: 1006,
            reason: "transport dropped".to_owned(),
        }
    }
}

/// Events a transport reports to the engine that owns it.
#[derive(Debug)]
pub enum TransportEvent {
    /// The socket is open. Implies the transport is writeable.
    Connected,
    /// A complete WebSocket message arrived. BLIP frames travel as binary
    /// messages; anything else is ignored with a warning.
    Message {
        data: Bytes,
        binary: bool,
    },
    /// The transport drained its write buffer and can accept more frames.
    Writeable,
    /// The socket closed. Terminal; no further events follow.
    Closed(CloseStatus),
}

/// Receiving half of a transport's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Writing half of the transport owned by the engine.
///
/// `send` hands over one whole frame per call; the transport must deliver
/// it as a single binary WebSocket message. Implementations signal
/// readiness for more data with [`TransportEvent::Writeable`] and must not
/// assume `close` is called exactly once.
pub trait Transport: Send + 'static {
    /// Queue one frame for delivery as a binary message.
    fn send(&mut self, frame: Bytes);

    /// Begin closing the socket. The matching
    /// [`TransportEvent::Closed`] arrives through the event stream.
    fn close(&mut self);
}

/// One half of an in-process transport pair.
pub struct LoopbackTransport {
    peer: mpsc::UnboundedSender<TransportEvent>,
    local: mpsc::UnboundedSender<TransportEvent>,
    open: bool,
}

/// Create two transports wired directly to each other.
///
/// Frames sent by one half arrive as binary messages on the other half's
/// event stream. Each stream starts with a [`TransportEvent::Connected`],
/// and every send is followed by a writeable signal, modelling a socket
/// whose buffer always drains.
#[must_use]
pub fn loopback_pair() -> (
    (LoopbackTransport, TransportEvents),
    (LoopbackTransport, TransportEvents),
) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let _ = a_tx.send(TransportEvent::Connected);
    let _ = b_tx.send(TransportEvent::Connected);
    (
        (
            LoopbackTransport {
                peer: b_tx.clone(),
                local: a_tx.clone(),
                open: true,
            },
            a_rx,
        ),
        (
            LoopbackTransport {
                peer: a_tx,
                local: b_tx,
                open: true,
            },
            b_rx,
        ),
    )
}

impl Transport for LoopbackTransport {
    fn send(&mut self, frame: Bytes) {
        if !self.open {
            return;
        }
        let _ = self.peer.send(TransportEvent::Message {
            data: frame,
            binary: true,
        });
        let _ = self.local.send(TransportEvent::Writeable);
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = self.peer.send(TransportEvent::Closed(CloseStatus::normal()));
        let _ = self
            .local
            .send(TransportEvent::Closed(CloseStatus::normal()));
    }
}
