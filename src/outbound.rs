//! Outgoing messages.
//!
//! A [`MessageOut`] owns the frozen payload produced by a
//! `MessageBuilder` and a cursor over it. The scheduler repeatedly asks
//! for the next frame-sized slice; the cursor makes partial-send
//! resumption a plain index rather than a suspended computation. The
//! message also tracks how many sent bytes the peer has yet to
//! acknowledge, which drives the freeze/thaw flow control.

use std::fmt;

use bytes::{BufMut, Bytes};

use crate::{
    builder::{MessageBuilder, MessageProgress, ProgressCallback, ProgressState},
    engine::CommandSender,
    error::BuildError,
    inbound::MessageIn,
    protocol::{FrameFlags, MessageNo, MessageType},
    varint,
};

/// State of one message being transmitted over many frames.
pub(crate) struct MessageOut {
    kind: MessageType,
    flags: FrameFlags,
    number: MessageNo,
    payload: Bytes,
    bytes_sent: usize,
    unacked_bytes: usize,
    pending_response: Option<MessageIn>,
    on_progress: Option<ProgressCallback>,
}

impl MessageOut {
    /// Serialize `builder` into a sendable message numbered `number`
    /// (0 when the engine assigns the number at queue time).
    ///
    /// A request that expects a reply gets a detached placeholder
    /// `MessageIn`; the engine files it under the message number once the
    /// last frame is sent.
    pub(crate) fn from_builder(
        builder: MessageBuilder,
        number: MessageNo,
        sender: &CommandSender,
    ) -> Result<Self, BuildError> {
        let finished = builder.finish()?;
        let kind = finished
            .flags
            .message_type()
            .unwrap_or(MessageType::Request);

        let mut message = Self {
            kind,
            flags: finished.flags,
            number,
            payload: finished.payload,
            bytes_sent: 0,
            unacked_bytes: 0,
            pending_response: None,
            on_progress: finished.on_progress,
        };
        if kind == MessageType::Request && !message.flags.is_no_reply() {
            // The placeholder's flags are updated when the first frame of
            // the reply arrives; the type may turn out to be an error.
            message.pending_response =
                Some(MessageIn::new(MessageType::Response, number, sender.clone()));
        }
        Ok(message)
    }

    /// An acknowledgement of `byte_count` cumulative bytes of message
    /// `number`. ACKs are urgent, expect no reply, and are never
    /// themselves acknowledged.
    pub(crate) fn ack(kind: MessageType, number: MessageNo, byte_count: u64) -> Self {
        debug_assert!(kind.is_ack());
        let mut payload = Vec::with_capacity(varint::MAX_VARINT_LEN);
        varint::write_uvarint(&mut payload, byte_count);
        Self {
            kind,
            flags: FrameFlags::new(kind)
                .with(FrameFlags::URGENT)
                .with(FrameFlags::NO_REPLY),
            number,
            payload: Bytes::from(payload),
            bytes_sent: 0,
            unacked_bytes: 0,
            pending_response: None,
            on_progress: None,
        }
    }

    #[must_use]
    pub(crate) fn number(&self) -> MessageNo { self.number }

    pub(crate) fn set_number(&mut self, number: MessageNo) {
        self.number = number;
        if let Some(response) = self.pending_response.as_mut() {
            response.set_number(number);
        }
    }

    #[must_use]
    pub(crate) fn message_type(&self) -> MessageType { self.kind }

    #[must_use]
    pub(crate) fn flags(&self) -> FrameFlags { self.flags }

    #[must_use]
    pub(crate) fn is_urgent(&self) -> bool { self.flags.is_urgent() }

    #[must_use]
    pub(crate) fn is_ack(&self) -> bool { self.kind.is_ack() }

    /// Whether this message answers a remote request. ACK numbering also
    /// distinguishes the two directions this way.
    #[must_use]
    pub(crate) fn is_reply(&self) -> bool { self.kind.is_reply() }

    #[must_use]
    pub(crate) fn bytes_sent(&self) -> usize { self.bytes_sent }

    #[must_use]
    pub(crate) fn payload_len(&self) -> usize { self.payload.len() }

    /// The next payload slice of at most `max_len` bytes, with the flags
    /// the carrying frame must use. `MORE_COMING` is set iff payload
    /// remains after this slice.
    pub(crate) fn next_frame(&mut self, max_len: usize) -> (Bytes, FrameFlags) {
        let len = max_len.min(self.payload.len() - self.bytes_sent);
        let slice = self.payload.slice(self.bytes_sent..self.bytes_sent + len);
        self.bytes_sent += len;
        self.unacked_bytes += len;
        let mut flags = self.flags;
        if self.bytes_sent < self.payload.len() {
            flags = flags.with(FrameFlags::MORE_COMING);
        }
        (slice, flags)
    }

    /// Whether the peer owes an ACK before more frames may be sent.
    #[must_use]
    pub(crate) fn needs_ack(&self, max_unacked: usize) -> bool {
        !self.is_ack() && self.unacked_bytes >= max_unacked
    }

    /// Record an ACK carrying the peer's cumulative received byte count.
    /// Stale or implausible counts are ignored.
    pub(crate) fn received_ack(&mut self, byte_count: u64) {
        if byte_count <= self.bytes_sent as u64 {
            self.unacked_bytes = self
                .unacked_bytes
                .min(self.bytes_sent - byte_count as usize);
        }
    }

    /// Detach the placeholder for this request's response, if any.
    pub(crate) fn take_pending_response(&mut self) -> Option<MessageIn> {
        let mut response = self.pending_response.take()?;
        response.set_number(self.number);
        response.set_progress(self.on_progress.take(), self.payload.len() as u64);
        Some(response)
    }

    /// Create the future fulfilled by this request's response.
    pub(crate) fn response_receiver(
        &mut self,
    ) -> Option<tokio::sync::oneshot::Receiver<std::sync::Arc<MessageIn>>> {
        self.pending_response
            .as_mut()
            .map(MessageIn::response_receiver)
    }

    pub(crate) fn notify_progress(&mut self, state: ProgressState) {
        if let Some(callback) = self.on_progress.as_mut() {
            callback(&MessageProgress {
                state,
                bytes_sent: self.bytes_sent as u64,
                bytes_received: 0,
                reply: None,
            });
        }
    }

    /// Encode the next frame of this message into `dst`, header included.
    /// Returns the frame flags used and the total frame length.
    pub(crate) fn encode_next_frame(
        &mut self,
        dst: &mut impl BufMut,
        max_payload_len: usize,
    ) -> (FrameFlags, usize) {
        let (body, flags) = self.next_frame(max_payload_len);
        let header = crate::frame::FrameHeader::new(self.number, flags);
        let header_len = header.encode_into(dst);
        dst.put_slice(&body);
        (flags, header_len + body.len())
    }
}

impl fmt::Debug for MessageOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageOut")
            .field("type", &self.kind.name())
            .field("number", &self.number)
            .field("flags", &self.flags)
            .field("bytes_sent", &self.bytes_sent)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}
