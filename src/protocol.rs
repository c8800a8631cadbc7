//! Wire-level protocol definitions.
//!
//! Message types, frame flags, and the constants shared by both peers of a
//! connection. The values here are wire-stable; changing them breaks
//! compatibility with existing peers.

use std::fmt;

/// Identifier of a logical message.
///
/// Each peer numbers its own requests 1, 2, 3... in send order. A response
/// carries the number of the remote request it answers, so request and
/// response numbers live in distinct per-direction namespaces.
pub type MessageNo = u64;

/// WebSocket subprotocol name advertised during the handshake.
pub const BLIP_SUBPROTOCOL: &str = "BLIP";

/// Cap on the encoded size of a message's property block.
///
/// Implementation-imposed rather than part of the wire protocol; both
/// building and receiving enforce it.
pub const MAX_PROPERTIES_SIZE: usize = 100 * 1024;

/// Kind of message carried in the low three bits of the frame flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A message initiated by a peer.
    Request = 0,
    /// A reply to a request.
    Response = 1,
    /// A reply indicating failure.
    Error = 2,
    /// Acknowledgement of bytes received from a request.
    AckRequest = 4,
    /// Acknowledgement of bytes received from a response.
    AckResponse = 5,
}

impl MessageType {
    /// Decode the type bits of a flags byte. Values 3, 6, and 7 are
    /// unassigned and yield `None`.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & FrameFlags::TYPE_MASK {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            4 => Some(Self::AckRequest),
            5 => Some(Self::AckResponse),
            _ => None,
        }
    }

    /// Short mnemonic used in log output.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Request => "REQ",
            Self::Response => "RES",
            Self::Error => "ERR",
            Self::AckRequest => "ACKREQ",
            Self::AckResponse => "ACKRES",
        }
    }

    /// Whether this is a reply to something the local peer sent.
    ///
    /// Errors count as responses; they answer a request just as a normal
    /// response does.
    #[must_use]
    pub fn is_reply(self) -> bool { matches!(self, Self::Response | Self::Error) }

    /// Whether this is one of the two acknowledgement types.
    #[must_use]
    pub fn is_ack(self) -> bool { matches!(self, Self::AckRequest | Self::AckResponse) }
}

/// The flags byte carried in every frame header.
///
/// Bits 0..=2 hold the [`MessageType`]; the remaining bits are boolean
/// flags. Bit 7 is reserved.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Mask of the bits holding the [`MessageType`].
    pub const TYPE_MASK: u8 = 0x07;
    /// The body of this message is deflate-compressed.
    pub const COMPRESSED: u8 = 0x08;
    /// The message is given priority delivery.
    pub const URGENT: u8 = 0x10;
    /// Request only: the sender will ignore any response.
    pub const NO_REPLY: u8 = 0x20;
    /// Another frame of this message follows. Meaningful per frame, never
    /// per message.
    pub const MORE_COMING: u8 = 0x40;

    /// Flags for a message of `message_type` with no boolean flags set.
    #[must_use]
    pub fn new(message_type: MessageType) -> Self { Self(message_type as u8) }

    /// Wrap a raw flags byte as received from the wire.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self { Self(bits) }

    /// The raw flags byte.
    #[must_use]
    pub const fn bits(self) -> u8 { self.0 }

    /// The message type encoded in the low bits, if assigned.
    #[must_use]
    pub fn message_type(self) -> Option<MessageType> { MessageType::from_bits(self.0) }

    /// A copy of these flags with the bits in `mask` set.
    #[must_use]
    pub const fn with(self, mask: u8) -> Self { Self(self.0 | mask) }

    /// A copy of these flags with the bits in `mask` cleared.
    #[must_use]
    pub const fn without(self, mask: u8) -> Self { Self(self.0 & !mask) }

    /// Whether any bit in `mask` is set.
    #[must_use]
    pub const fn contains(self, mask: u8) -> bool { self.0 & mask != 0 }

    #[must_use]
    pub const fn is_compressed(self) -> bool { self.contains(Self::COMPRESSED) }

    #[must_use]
    pub const fn is_urgent(self) -> bool { self.contains(Self::URGENT) }

    #[must_use]
    pub const fn is_no_reply(self) -> bool { self.contains(Self::NO_REPLY) }

    #[must_use]
    pub const fn more_coming(self) -> bool { self.contains(Self::MORE_COMING) }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameFlags({:#04x})", self.0)
    }
}
