//! Incoming messages.
//!
//! A [`MessageIn`] accumulates the frames of one incoming message. Frames
//! append to an internal buffer; once enough bytes are present the property
//! block is parsed, and the frame that clears `MORE_COMING` finalizes the
//! message, inflating the body when the message is compressed. Completed
//! messages are shared with handlers and response futures behind an `Arc`
//! and expose read accessors plus the reply operations.
//!
//! While a message is being received, roughly every
//! [`ConnectionConfig::incoming_ack_interval`](crate::connection::ConnectionConfig)
//! payload bytes the receiver owes the peer an acknowledgement carrying
//! the cumulative received byte count; frame delivery reports when one
//! is due so the engine can send it.

use std::{fmt, io::Read, sync::Arc};

use bytes::Bytes;
use flate2::read::DeflateDecoder;
use log::{trace, warn};
use tokio::sync::oneshot;

use crate::{
    builder::{MessageBuilder, MessageProgress, ProgressCallback, ProgressState},
    engine::{Command, CommandSender},
    error::{ProtocolError, SendError},
    outbound::MessageOut,
    properties::Properties,
    protocol::{FrameFlags, MessageNo, MessageType},
    varint,
};

/// Error information carried by a completed error reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedError {
    /// Namespace of the error code, e.g. `"BLIP"` or `"HTTP"`.
    pub domain: String,
    /// Numeric code within the domain.
    pub code: i64,
    /// Human-readable description from the message body.
    pub message: String,
}

/// Outcome of feeding one frame to a [`MessageIn`].
pub(crate) struct FrameOutcome {
    /// The message is fully received and may be dispatched.
    pub(crate) complete: bool,
    /// Cumulative byte count to acknowledge to the peer, when due.
    pub(crate) ack_due: Option<u64>,
}

/// An incoming request or reply, reassembled from its frames.
pub struct MessageIn {
    kind: MessageType,
    flags: FrameFlags,
    number: MessageNo,
    sender: CommandSender,
    started: bool,
    properties_size: usize,
    buf: Vec<u8>,
    body_buf: Vec<u8>,
    properties: Properties,
    parsed_properties: bool,
    body: Bytes,
    bytes_received: u64,
    unacked_bytes: usize,
    outgoing_size: u64,
    on_progress: Option<ProgressCallback>,
    future: Option<oneshot::Sender<Arc<MessageIn>>>,
    complete: bool,
}

impl MessageIn {
    pub(crate) fn new(kind: MessageType, number: MessageNo, sender: CommandSender) -> Self {
        Self {
            kind,
            flags: FrameFlags::new(kind),
            number,
            sender,
            started: false,
            properties_size: 0,
            buf: Vec::new(),
            body_buf: Vec::new(),
            properties: Properties::default(),
            parsed_properties: false,
            body: Bytes::new(),
            bytes_received: 0,
            unacked_bytes: 0,
            outgoing_size: 0,
            on_progress: None,
            future: None,
            complete: false,
        }
    }

    /// Number of the message. For a reply this is the number of the local
    /// request it answers.
    #[must_use]
    pub fn number(&self) -> MessageNo { self.number }

    #[must_use]
    pub fn message_type(&self) -> MessageType { self.kind }

    #[must_use]
    pub fn is_error(&self) -> bool { self.kind == MessageType::Error }

    #[must_use]
    pub fn is_urgent(&self) -> bool { self.flags.is_urgent() }

    #[must_use]
    pub fn is_no_reply(&self) -> bool { self.flags.is_no_reply() }

    /// Whether the final frame has been received and the body is ready.
    #[must_use]
    pub fn is_complete(&self) -> bool { self.complete }

    /// The value of the property named `name`, if present.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> { self.properties.get(name) }

    /// The value of `name` parsed as an integer, or `default`.
    #[must_use]
    pub fn int_property(&self, name: &str, default: i64) -> i64 {
        self.property(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// The value of `name` read as a boolean, or `default`. Accepts `true`,
    /// `false`, and integers (zero is false).
    #[must_use]
    pub fn bool_property(&self, name: &str, default: bool) -> bool {
        match self.property(name) {
            Some("true") => true,
            Some("false") => false,
            Some(v) => v.parse::<i64>().map(|n| n != 0).unwrap_or(default),
            None => default,
        }
    }

    /// All properties in wire order.
    #[must_use]
    pub fn properties(&self) -> &Properties { &self.properties }

    /// The message body. Empty until the message is complete; already
    /// inflated when the message was compressed.
    #[must_use]
    pub fn body(&self) -> &[u8] { &self.body }

    /// Deserialize the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error when the body is not
    /// valid JSON for `T`.
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Error details when this message is an error reply.
    #[must_use]
    pub fn error(&self) -> Option<ReceivedError> {
        if !self.is_error() {
            return None;
        }
        Some(ReceivedError {
            domain: self.property("Error-Domain").unwrap_or_default().to_owned(),
            code: self.int_property("Error-Code", 0),
            message: String::from_utf8_lossy(&self.body).into_owned(),
        })
    }

    /// Send `builder` as the response to this request.
    ///
    /// A request sent no-reply is answered by nobody; the response is
    /// logged and dropped. Builders still typed as requests become
    /// responses automatically.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] if the connection is gone, or a build
    /// error if the response fails to serialize.
    pub fn respond(&self, mut builder: MessageBuilder) -> Result<(), SendError> {
        if self.is_no_reply() {
            warn!("ignoring attempt to respond to no-reply request #{}", self.number);
            return Ok(());
        }
        debug_assert!(!self.kind.is_reply(), "replies cannot be responded to");
        if builder.message_type == MessageType::Request {
            builder.message_type = MessageType::Response;
        }
        let message = MessageOut::from_builder(builder, self.number, &self.sender)?;
        self.sender
            .send(Command::Send(message))
            .map_err(|_| SendError::Closed)
    }

    /// Respond with an error of `domain`/`code`, with `message` as body.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] if the connection is gone.
    pub fn respond_with_error(
        &self,
        domain: &str,
        code: i64,
        message: &str,
    ) -> Result<(), SendError> {
        if self.is_no_reply() {
            return Ok(());
        }
        let mut builder = MessageBuilder::response_to(self);
        builder.make_error(domain, code, message);
        self.respond(builder)
    }

    /// Respond that no handler was found for this request (`BLIP`/404).
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] if the connection is gone.
    pub fn not_handled(&self) -> Result<(), SendError> {
        self.respond_with_error("BLIP", 404, "no handler for message")
    }

    pub(crate) fn set_number(&mut self, number: MessageNo) { self.number = number; }

    pub(crate) fn set_progress(&mut self, callback: Option<ProgressCallback>, outgoing_size: u64) {
        self.on_progress = callback;
        self.outgoing_size = outgoing_size;
    }

    /// Create the oneshot this message fulfils on completion.
    pub(crate) fn response_receiver(&mut self) -> oneshot::Receiver<Arc<MessageIn>> {
        debug_assert!(self.future.is_none());
        let (tx, rx) = oneshot::channel();
        self.future = Some(tx);
        rx
    }

    pub(crate) fn take_future(&mut self) -> Option<oneshot::Sender<Arc<MessageIn>>> {
        self.future.take()
    }

    pub(crate) fn take_progress(&mut self) -> Option<ProgressCallback> { self.on_progress.take() }

    /// Total payload bytes received so far.
    pub(crate) fn bytes_received(&self) -> u64 { self.bytes_received }

    /// Payload size of the request this reply answers, when known.
    pub(crate) fn outgoing_size(&self) -> u64 { self.outgoing_size }

    /// Append one frame's payload.
    ///
    /// On the first frame the message adopts the frame's flags (a pending
    /// response may turn out to be an error, urgent, or compressed) and
    /// reads the property-length prefix. The frame clearing `MORE_COMING`
    /// finalizes the message. `max_properties_size` bounds the declared
    /// property block; `ack_interval` sets how many payload bytes may
    /// accumulate before an acknowledgement is due.
    pub(crate) fn received_frame(
        &mut self,
        frame: &[u8],
        frame_flags: FrameFlags,
        max_properties_size: usize,
        ack_interval: usize,
    ) -> Result<FrameOutcome, ProtocolError> {
        debug_assert!(!self.complete);
        let mut frame = frame;
        self.bytes_received += frame.len() as u64;
        self.unacked_bytes += frame.len();

        if !self.started {
            self.started = true;
            self.flags = frame_flags.without(FrameFlags::MORE_COMING);
            if let Some(kind) = frame_flags.message_type() {
                self.kind = kind;
            }
            trace!(
                "receiving {} #{}, flags={:#04x}",
                self.kind.name(),
                self.number,
                frame_flags.bits()
            );
            let (size, consumed) = varint::read_uvarint(frame)
                .ok_or(ProtocolError::TruncatedPropertyLength)?;
            if size > max_properties_size as u64 {
                return Err(ProtocolError::PropertiesTooLarge {
                    size,
                    max: max_properties_size,
                });
            }
            self.properties_size = size as usize;
            frame = &frame[consumed..];
        }

        if !self.parsed_properties {
            let missing = self.properties_size - self.buf.len();
            if frame.len() >= missing {
                self.buf.extend_from_slice(&frame[..missing]);
                frame = &frame[missing..];
                self.properties = Properties::parse(&self.buf)?;
                self.parsed_properties = true;
                self.buf = Vec::new();
            } else {
                self.buf.extend_from_slice(frame);
                frame = &[];
            }
        }

        self.body_buf.extend_from_slice(frame);

        let mut ack_due = None;
        if self.unacked_bytes >= ack_interval {
            ack_due = Some(self.bytes_received);
            self.unacked_bytes = 0;
        }

        if frame_flags.more_coming() {
            self.notify_progress(ProgressState::ReceivingReply, None);
            return Ok(FrameOutcome {
                complete: false,
                ack_due,
            });
        }

        if !self.parsed_properties {
            return Err(ProtocolError::IncompleteProperties);
        }
        self.body = if self.flags.is_compressed() {
            Bytes::from(inflate(&self.body_buf)?)
        } else {
            Bytes::from(std::mem::take(&mut self.body_buf))
        };
        self.body_buf = Vec::new();
        self.complete = true;
        trace!(
            "finished receiving {} #{}, {} body bytes",
            self.kind.name(),
            self.number,
            self.body.len()
        );
        Ok(FrameOutcome {
            complete: true,
            ack_due,
        })
    }

    /// The acknowledgement type a receiver of this message must send.
    pub(crate) fn ack_type(&self) -> MessageType {
        if self.kind.is_reply() {
            MessageType::AckResponse
        } else {
            MessageType::AckRequest
        }
    }

    pub(crate) fn notify_progress(&mut self, state: ProgressState, reply: Option<Arc<MessageIn>>) {
        if let Some(callback) = self.on_progress.as_mut() {
            callback(&MessageProgress {
                state,
                bytes_sent: self.outgoing_size,
                bytes_received: self.bytes_received,
                reply,
            });
        }
    }
}

impl fmt::Debug for MessageIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageIn")
            .field("type", &self.kind.name())
            .field("number", &self.number)
            .field("flags", &self.flags)
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

fn inflate(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut inflated = Vec::with_capacity(body.len().saturating_mul(2));
    DeflateDecoder::new(body)
        .read_to_end(&mut inflated)
        .map_err(ProtocolError::Decompress)?;
    Ok(inflated)
}
