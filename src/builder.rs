//! Construction of outgoing messages.
//!
//! A [`MessageBuilder`] collects properties and body bytes and serializes
//! them into the payload a message transmits across its frames: the
//! length-prefixed property block followed by the (optionally deflated)
//! body. Compression is decided here, once, while the payload is frozen;
//! frames later carry consecutive slices of the result.

use std::io::Write;

use bytes::Bytes;
use flate2::{Compression, write::DeflateEncoder};
use log::debug;

use crate::{
    error::BuildError,
    inbound::MessageIn,
    properties,
    protocol::{FrameFlags, MAX_PROPERTIES_SIZE, MessageType},
    varint,
};

/// Progress of an outgoing request through its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressState {
    /// Queued in the outbox, nothing sent yet.
    Queued,
    /// At least one frame has been handed to the transport.
    Sending,
    /// Fully sent; a response is expected.
    AwaitingReply,
    /// Frames of the response are arriving.
    ReceivingReply,
    /// The exchange is finished.
    Complete,
}

/// Progress notification for an outgoing request.
#[derive(Clone, Debug)]
pub struct MessageProgress {
    pub state: ProgressState,
    /// Payload bytes handed to the transport so far.
    pub bytes_sent: u64,
    /// Payload bytes of the reply received so far.
    pub bytes_received: u64,
    /// The completed reply, present once `state` is [`ProgressState::Complete`].
    pub reply: Option<std::sync::Arc<MessageIn>>,
}

/// Callback invoked as an outgoing request progresses.
pub type ProgressCallback = Box<dyn FnMut(&MessageProgress) + Send + Sync>;

/// Builder for an outgoing request, response, or error message.
///
/// ```
/// use blip::MessageBuilder;
///
/// let mut builder = MessageBuilder::request("ping");
/// builder.add_property("client", "example").write(b"hello");
/// ```
pub struct MessageBuilder {
    /// Kind of message being built. Defaults to a request.
    pub message_type: MessageType,
    /// Give the message priority delivery.
    pub urgent: bool,
    /// Deflate the body if that makes it smaller.
    pub compressed: bool,
    /// Request only: declare that any response will be ignored.
    pub no_reply: bool,
    pub(crate) on_progress: Option<ProgressCallback>,
    properties: Vec<u8>,
    body: Vec<u8>,
}

impl MessageBuilder {
    /// An empty request builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_type: MessageType::Request,
            urgent: false,
            compressed: false,
            no_reply: false,
            on_progress: None,
            properties: Vec::new(),
            body: Vec::new(),
        }
    }

    /// A request builder with its `Profile` property already set.
    #[must_use]
    pub fn request(profile: &str) -> Self {
        let mut builder = Self::new();
        builder.add_property("Profile", profile);
        builder
    }

    /// A response builder for `request`, inheriting its urgency.
    #[must_use]
    pub fn response_to(request: &MessageIn) -> Self {
        debug_assert!(!request.message_type().is_reply());
        let mut builder = Self::new();
        builder.message_type = MessageType::Response;
        builder.urgent = request.is_urgent();
        builder
    }

    /// Append a property. Properties keep their insertion order on the wire.
    ///
    /// # Panics
    ///
    /// Panics if either string contains NUL or starts with a byte below
    /// 0x20; property strings are a caller contract.
    pub fn add_property(&mut self, name: &str, value: &str) -> &mut Self {
        properties::write_tokenized(&mut self.properties, name);
        properties::write_tokenized(&mut self.properties, value);
        self
    }

    /// Append a property with a numeric value.
    pub fn add_int_property(&mut self, name: &str, value: i64) -> &mut Self {
        self.add_property(name, &value.to_string())
    }

    /// Append every pair yielded by `pairs`.
    pub fn add_properties<'a, I>(&mut self, pairs: I) -> &mut Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in pairs {
            self.add_property(name, value);
        }
        self
    }

    /// Turn this builder into an error message: sets the type, adds the
    /// `Error-Domain` and `Error-Code` properties, and writes the
    /// human-readable `message` as the body.
    pub fn make_error(&mut self, domain: &str, code: i64, message: &str) -> &mut Self {
        debug_assert!(!domain.is_empty());
        self.message_type = MessageType::Error;
        self.add_property("Error-Domain", domain);
        self.add_int_property("Error-Code", code);
        self.body.extend_from_slice(message.as_bytes());
        self
    }

    /// Append bytes to the message body.
    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.body.extend_from_slice(data);
        self
    }

    /// Register a callback receiving [`MessageProgress`] notifications.
    pub fn on_progress<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&MessageProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// The flags byte this message will carry, before framing adds
    /// [`FrameFlags::MORE_COMING`].
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::new(self.message_type);
        if self.urgent {
            flags = flags.with(FrameFlags::URGENT);
        }
        if self.compressed {
            flags = flags.with(FrameFlags::COMPRESSED);
        }
        if self.no_reply {
            flags = flags.with(FrameFlags::NO_REPLY);
        }
        flags
    }

    /// Serialize into the frozen payload a `MessageOut` transmits.
    pub(crate) fn finish(mut self) -> Result<FinishedMessage, BuildError> {
        if self.properties.len() > MAX_PROPERTIES_SIZE {
            return Err(BuildError::PropertiesTooLarge {
                size: self.properties.len(),
                max: MAX_PROPERTIES_SIZE,
            });
        }

        let mut flags = self.flags();
        let body = if self.compressed {
            match deflate(&self.body) {
                // Keep the flag only when compression actually pays off.
                Some(smaller) if smaller.len() < self.body.len() => smaller,
                _ => {
                    flags = flags.without(FrameFlags::COMPRESSED);
                    self.body
                }
            }
        } else {
            self.body
        };

        let mut payload =
            Vec::with_capacity(varint::MAX_VARINT_LEN + self.properties.len() + body.len());
        varint::write_uvarint(&mut payload, self.properties.len() as u64);
        payload.append(&mut self.properties);
        payload.extend_from_slice(&body);

        Ok(FinishedMessage {
            payload: Bytes::from(payload),
            flags,
            on_progress: self.on_progress,
        })
    }
}

impl Default for MessageBuilder {
    fn default() -> Self { Self::new() }
}

/// A serialized message ready to become a `MessageOut`.
pub(crate) struct FinishedMessage {
    pub(crate) payload: Bytes,
    pub(crate) flags: FrameFlags,
    pub(crate) on_progress: Option<ProgressCallback>,
}

fn deflate(body: &[u8]) -> Option<Vec<u8>> {
    if body.is_empty() {
        return None;
    }
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(body.len() / 2),
        Compression::default(),
    );
    match encoder.write_all(body).and_then(|()| encoder.finish()) {
        Ok(compressed) => Some(compressed),
        Err(err) => {
            debug!("body compression failed, sending uncompressed: {err}");
            None
        }
    }
}
