//! Error types for the connection API and the wire protocol.
//!
//! Errors split into three audiences: [`BuildError`] and [`SendError`] are
//! returned to callers constructing and sending messages,
//! [`ConnectionError`] completes response futures, and
//! [`ProtocolError`] describes violations found in received data. Protocol
//! violations never tear down a connection; the engine logs them and drops
//! the offending message, so `ProtocolError` surfaces only in logs.

use std::io;

use thiserror::Error;

use crate::properties::PropertyError;

/// Errors raised while serializing an outgoing message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The encoded property block exceeds the protocol cap.
    #[error("encoded properties occupy {size} bytes, over the {max} byte cap")]
    PropertiesTooLarge {
        /// Encoded size of the property block.
        size: usize,
        /// Maximum permitted size.
        max: usize,
    },
}

/// Errors returned when queueing an outgoing message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SendError {
    /// The connection has been closed; the engine is gone.
    #[error("connection is closed")]
    Closed,
    /// Only request messages can be sent as new requests.
    #[error("message is a {0}, not a request")]
    NotARequest(&'static str),
    /// The request was marked no-reply, so no response future exists.
    #[error("a no-reply request cannot return a response")]
    NoReply,
    /// The message could not be serialized.
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Terminal errors delivered through response futures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The connection closed before the response arrived.
    #[error("connection closed before a response arrived")]
    Closed,
}

/// Violations found in received frames or message content.
///
/// These are logged as warnings and the offending message is discarded;
/// the connection itself stays up.
#[derive(Debug, Error)]
pub(crate) enum ProtocolError {
    /// The property block's length prefix is missing or truncated.
    #[error("frame too small to hold the property length")]
    TruncatedPropertyLength,
    /// The declared property block exceeds the receive cap.
    #[error("declared property block of {size} bytes exceeds the {max} byte cap")]
    PropertiesTooLarge {
        /// Declared size of the property block.
        size: u64,
        /// Maximum permitted size.
        max: usize,
    },
    /// The final frame arrived before the property block was complete.
    #[error("message ended before the end of its properties")]
    IncompleteProperties,
    /// The property block failed to parse.
    #[error(transparent)]
    Properties(#[from] PropertyError),
    /// The compressed body failed to inflate.
    #[error("message body failed to inflate: {0}")]
    Decompress(#[source] io::Error),
}
