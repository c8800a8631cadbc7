#![doc(html_root_url = "https://docs.rs/blip/latest")]
//! Public API for the `blip` library.
//!
//! BLIP is a bidirectional, multiplexed request/response messaging
//! protocol carried over a binary WebSocket transport. Many logical
//! messages interleave at the frame level over one socket, with
//! per-message priority, optional body compression, optional no-reply
//! requests, and ACK-based flow control, so large transfers share the
//! connection without blocking urgent control traffic.
//!
//! This crate is the connection engine: the frame codec, the message
//! builder, the outbound scheduler, and the inbound reassembler and
//! dispatcher. The WebSocket itself stays behind the
//! [`Transport`](transport::Transport) seam, so any client or server
//! socket implementation can carry a connection.

pub mod builder;
pub mod connection;
mod engine;
pub mod error;
pub mod frame;
pub mod inbound;
mod outbound;
pub mod properties;
pub mod protocol;
mod queue;
pub mod transport;
pub mod varint;

pub use builder::{MessageBuilder, MessageProgress, ProgressState};
pub use connection::{
    Connection,
    ConnectionConfig,
    ConnectionDelegate,
    HandlerResult,
    RequestHandler,
    ResponseFuture,
};
pub use error::{BuildError, ConnectionError, SendError};
pub use frame::FrameHeader;
pub use inbound::{MessageIn, ReceivedError};
pub use properties::Properties;
pub use protocol::{BLIP_SUBPROTOCOL, FrameFlags, MessageNo, MessageType};
pub use transport::{CloseStatus, Transport, TransportEvent, TransportEvents, loopback_pair};
