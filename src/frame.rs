//! Frame header encoding and decoding.
//!
//! Each WebSocket binary message carries exactly one frame:
//! `varint(message number) || varint(flags) || payload`. The codec here is
//! a pure pair of encode/decode operations with no hidden state; framing
//! of the payload itself is the transport's job.

use bytes::BufMut;

use crate::{
    protocol::{FrameFlags, MessageNo},
    varint::{self, MAX_VARINT_LEN},
};

/// The decoded header of a single frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Number of the message this frame belongs to.
    pub number: MessageNo,
    /// Flags byte, including the message type bits.
    pub flags: FrameFlags,
}

impl FrameHeader {
    /// Upper bound on the encoded size of a header.
    pub const MAX_ENCODED_LEN: usize = 2 * MAX_VARINT_LEN;

    /// Bytes reserved for the header when sizing a frame's payload slice.
    ///
    /// Ample for the message number and flags varints of any realistic
    /// message, keeping frames at the configured cap.
    pub const RESERVE: usize = 10;

    #[must_use]
    pub fn new(number: MessageNo, flags: FrameFlags) -> Self { Self { number, flags } }

    /// Append the encoded header to `dst` and return the bytes written.
    pub fn encode_into(&self, dst: &mut impl BufMut) -> usize {
        let mut written = varint::write_uvarint(dst, self.number);
        written += varint::write_uvarint(dst, u64::from(self.flags.bits()));
        written
    }

    /// Decode a header from the front of `src`.
    ///
    /// Returns the header and the number of bytes it occupied; the frame's
    /// payload is whatever follows. Returns `None` when the header is
    /// truncated or the flags varint does not fit a single byte, which the
    /// caller should treat as a malformed frame to discard.
    #[must_use]
    pub fn decode(src: &[u8]) -> Option<(Self, usize)> {
        let (number, n) = varint::read_uvarint(src)?;
        let (flags, m) = varint::read_uvarint(&src[n..])?;
        let flags = u8::try_from(flags).ok()?;
        Some((
            Self {
                number,
                flags: FrameFlags::from_bits(flags),
            },
            n + m,
        ))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::protocol::MessageType;

    #[rstest]
    #[case(1, 0x00, &[0x01, 0x00])]
    #[case(1, 0x40, &[0x01, 0x40])]
    #[case(300, 0x12, &[0xac, 0x02, 0x12])]
    fn encodes_known_headers(#[case] number: MessageNo, #[case] flags: u8, #[case] wire: &[u8]) {
        let header = FrameHeader::new(number, FrameFlags::from_bits(flags));
        let mut buf = Vec::new();
        assert_eq!(header.encode_into(&mut buf), wire.len());
        assert_eq!(buf, wire);
    }

    #[test]
    fn round_trips_with_payload() {
        let flags = FrameFlags::new(MessageType::Error).with(FrameFlags::MORE_COMING);
        let header = FrameHeader::new(u64::MAX, flags);
        let mut buf = Vec::new();
        let len = header.encode_into(&mut buf);
        buf.extend_from_slice(b"payload");

        let (decoded, consumed) = FrameHeader::decode(&buf).expect("valid header");
        assert_eq!(decoded, header);
        assert_eq!(consumed, len);
        assert_eq!(&buf[consumed..], b"payload");
    }

    #[rstest]
    #[case(&[])]
    #[case(&[0x80])]
    #[case(&[0x01])]
    #[case(&[0x01, 0x80])]
    fn truncated_headers_are_rejected(#[case] src: &[u8]) {
        assert_eq!(FrameHeader::decode(src), None);
    }

    #[test]
    fn oversized_flags_are_rejected() {
        // varint(1) then varint(0x100): flags must fit one byte.
        let src = [0x01, 0x80, 0x02];
        assert_eq!(FrameHeader::decode(&src), None);
    }
}
