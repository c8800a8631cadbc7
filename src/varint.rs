//! Unsigned LEB128 integers.
//!
//! Frame headers, property-block lengths, and ACK payloads all carry
//! unsigned varints. Encoding writes seven bits per byte, least significant
//! group first, with the high bit set on every byte except the last.

use bytes::BufMut;

/// Maximum number of bytes a `u64` varint can occupy.
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` to `dst` as an unsigned LEB128 varint.
///
/// Returns the number of bytes written.
pub fn write_uvarint(dst: &mut impl BufMut, mut value: u64) -> usize {
    let mut written = 1;
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
        written += 1;
    }
    dst.put_u8(value as u8);
    written
}

/// Number of bytes [`write_uvarint`] would emit for `value`.
#[must_use]
pub fn uvarint_len(value: u64) -> usize {
    let bits = 64 - value.max(1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Decode an unsigned LEB128 varint from the front of `src`.
///
/// Returns the value and the number of bytes consumed, or `None` if `src`
/// ends mid-varint or the encoding overflows 64 bits.
#[must_use]
pub fn read_uvarint(src: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        let group = u64::from(byte & 0x7f);
        // The tenth byte may only contribute the single remaining bit.
        if shift == 63 && group > 1 {
            return None;
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}
