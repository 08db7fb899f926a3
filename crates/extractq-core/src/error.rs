//! Error types for the extractq wire protocol.
//!
//! This module defines the central `Error` enum, covering everything that can
//! go wrong between the bytes arriving on a socket and a typed message being
//! handed to the caller.
//!
//! ## Error Cases
//! - `InvalidLength`: The netstring length prefix is not a decimal number.
//! - `FrameTooLarge`: The announced payload exceeds the configured maximum.
//! - `MissingTerminator`: The payload is not followed by `,`.
//! - `UnexpectedEof`: The stream ended in the middle of a frame.
//! - `Json`: The payload is not valid JSON, or not the expected shape.
//! - `InvalidRequest`: Valid JSON that is neither a ping nor a place request.
//! - `AckViolation`: The peer answered with something other than `ack`.
//! - `Io`: The underlying transport failed.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for framing, decoding and the acknowledgment handshake.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The length prefix contains something other than ASCII digits.
    #[error("Invalid frame length prefix: {prefix:?}")]
    InvalidLength { prefix: String },

    /// The announced payload is larger than the codec accepts.
    #[error("Frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// The byte after the payload was not the `,` terminator.
    #[error("Frame terminator missing, found byte {found:#04x}")]
    MissingTerminator { found: u8 },

    /// The peer closed the stream with a partial frame buffered.
    #[error("Stream closed in the middle of a frame ({buffered} bytes buffered)")]
    UnexpectedEof { buffered: usize },

    /// Payload could not be decoded as JSON.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload decoded but does not describe a known request.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The peer replied to a message with something other than the
    /// acknowledgment token.
    #[error("Expected acknowledgment, got {got:?}")]
    AckViolation { got: String },

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
