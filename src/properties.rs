//! Message property encoding and parsing.
//!
//! Properties are an ordered list of `(name, value)` string pairs carried
//! at the front of every message as a length-prefixed block:
//! `varint(byte length) || name NUL value NUL ...`. A handful of well-known
//! strings are abbreviated to a single byte in `0x01..=0x0E`; literal
//! strings therefore must not begin with a control byte, keeping tokens and
//! literals unambiguous on decode.

use std::{fmt, slice};

use thiserror::Error;

/// Well-known strings encoded as a single byte on the wire.
///
/// The token for `TOKENS[i]` is `i + 1`. The order is wire-stable;
/// changing this array breaks compatibility with existing peers.
pub const TOKENS: [&str; 14] = [
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain; charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

/// The single-byte token for `s`, if it is one of the well-known strings.
#[must_use]
pub fn tokenize(s: &str) -> Option<u8> {
    TOKENS
        .iter()
        .position(|&t| t == s)
        .map(|i| (i + 1) as u8)
}

/// The well-known string for `token`, if assigned.
#[must_use]
pub fn untokenize(token: u8) -> Option<&'static str> {
    (1..=TOKENS.len() as u8)
        .contains(&token)
        .then(|| TOKENS[usize::from(token) - 1])
}

/// Whether `s` may appear as a property name or value.
///
/// Strings must not contain NUL and, unless empty, must not begin with a
/// byte below 0x20.
#[must_use]
pub fn is_valid_property_string(s: &str) -> bool {
    !s.as_bytes().contains(&0) && s.as_bytes().first().is_none_or(|&b| b >= 0x20)
}

/// Append `s` to `out` as a NUL-terminated string, abbreviating it to its
/// single-byte token when one exists.
///
/// # Panics
///
/// Panics if `s` violates [`is_valid_property_string`]; property strings
/// are a caller contract.
pub(crate) fn write_tokenized(out: &mut Vec<u8>, s: &str) {
    assert!(
        is_valid_property_string(s),
        "property strings must not contain NUL or start with a control byte"
    );
    match tokenize(s) {
        Some(token) => out.push(token),
        None => out.extend_from_slice(s.as_bytes()),
    }
    out.push(0);
}

/// Errors found while parsing a received property block.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    /// The block is non-empty but its last byte is not NUL.
    #[error("property block is not NUL-terminated")]
    Unterminated,
    /// The block holds an odd number of strings.
    #[error("property {name:?} has no value")]
    MissingValue {
        /// Name of the dangling property.
        name: String,
    },
    /// A string begins with a control byte that is not a known token.
    #[error("unknown property token {0:#04x}")]
    UnknownToken(u8),
    /// A literal string is not valid UTF-8.
    #[error("property string is not valid UTF-8")]
    InvalidUtf8,
}

/// Parsed properties of a message, in wire order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    /// Parse the body of a property block (the bytes after the varint
    /// length prefix).
    ///
    /// # Errors
    ///
    /// Returns a [`PropertyError`] when the block is malformed; the caller
    /// treats this as a protocol violation on the containing message.
    pub fn parse(raw: &[u8]) -> Result<Self, PropertyError> {
        if raw.last().is_some_and(|&b| b != 0) {
            return Err(PropertyError::Unterminated);
        }

        let mut strings = raw.split(|&b| b == 0);
        // split() yields one empty trailing piece for the final NUL.
        strings.next_back();

        let mut entries = Vec::new();
        let mut name: Option<String> = None;
        for piece in strings {
            let string = decode_string(piece)?;
            match name.take() {
                None => name = Some(string),
                Some(n) => entries.push((n, string)),
            }
        }
        if let Some(name) = name {
            return Err(PropertyError::MissingValue { name });
        }
        Ok(Self { entries })
    }

    /// The value of the first property named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over the `(name, value)` pairs in wire order.
    pub fn iter(&self) -> slice::Iter<'_, (String, String)> { self.entries.iter() }

    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

fn decode_string(piece: &[u8]) -> Result<String, PropertyError> {
    if let &[token] = piece {
        if token < 0x20 {
            return untokenize(token)
                .map(str::to_owned)
                .ok_or(PropertyError::UnknownToken(token));
        }
    }
    if piece.first().is_some_and(|&b| b < 0x20) {
        return Err(PropertyError::UnknownToken(piece[0]));
    }
    String::from_utf8(piece.to_vec()).map_err(|_| PropertyError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn encode(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in pairs {
            write_tokenized(&mut out, name);
            write_tokenized(&mut out, value);
        }
        out
    }

    #[test]
    fn token_table_round_trips() {
        for (i, &s) in TOKENS.iter().enumerate() {
            let token = (i + 1) as u8;
            assert_eq!(tokenize(s), Some(token));
            assert_eq!(untokenize(token), Some(s));
        }
        assert_eq!(tokenize("ping"), None);
        assert_eq!(untokenize(0), None);
        assert_eq!(untokenize(15), None);
    }

    #[test]
    fn known_strings_shrink_to_one_byte() {
        let tokenized = encode(&[("Profile", "ping")]);
        assert_eq!(tokenized, [0x01, 0x00, b'p', b'i', b'n', b'g', 0x00]);

        let mut literal = Vec::new();
        literal.extend_from_slice(b"Profile\0ping\0");
        assert!(tokenized.len() < literal.len());
    }

    #[test]
    fn parse_round_trips_tokens_and_literals() {
        let raw = encode(&[
            ("Profile", "getCheckpoint"),
            ("Content-Type", "application/json"),
            ("client", "test"),
        ]);
        let props = Properties::parse(&raw).expect("valid block");
        assert_eq!(props.len(), 3);
        assert_eq!(props.get("Profile"), Some("getCheckpoint"));
        assert_eq!(props.get("Content-Type"), Some("application/json"));
        assert_eq!(props.get("client"), Some("test"));
        assert_eq!(props.get("missing"), None);
    }

    #[test]
    fn empty_block_parses_to_no_properties() {
        let props = Properties::parse(&[]).expect("empty block");
        assert!(props.is_empty());
    }

    #[rstest]
    #[case(b"Profile".as_slice(), PropertyError::Unterminated)]
    #[case(b"Profile\0".as_slice(), PropertyError::MissingValue { name: "Profile".into() })]
    #[case(b"\x1f\0x\0".as_slice(), PropertyError::UnknownToken(0x1f))]
    #[case(b"\xff\xfe\0x\0".as_slice(), PropertyError::InvalidUtf8)]
    fn malformed_blocks_are_rejected(#[case] raw: &[u8], #[case] expected: PropertyError) {
        assert_eq!(Properties::parse(raw), Err(expected));
    }

    #[test]
    #[should_panic(expected = "property strings")]
    fn nul_in_property_string_is_a_contract_violation() {
        let mut out = Vec::new();
        write_tokenized(&mut out, "bad\0string");
    }

    prop_compose! {
        // Strings legal in a property block: printable first byte, no NUL.
        fn property_string()(s in "[ -~][^\\x00]{0,20}") -> String { s }
    }

    proptest! {
        #[test]
        fn arbitrary_pairs_round_trip(
            pairs in prop::collection::vec((property_string(), property_string()), 0..8)
        ) {
            let mut raw = Vec::new();
            for (name, value) in &pairs {
                write_tokenized(&mut raw, name);
                write_tokenized(&mut raw, value);
            }
            let props = Properties::parse(&raw).expect("valid block");
            let decoded: Vec<(String, String)> =
                props.iter().cloned().collect();
            prop_assert_eq!(decoded, pairs);
        }
    }
}
