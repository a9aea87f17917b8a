//! Codec for encoding and decoding Relay messages.
//!
//! Messages travel as UTF-8 JSON, one message per transport frame.

use bytes::Bytes;
use thiserror::Error;

use crate::message::Message;

/// Hard ceiling on the size of a single encoded message (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the allowed size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Limit that was exceeded.
        max: usize,
    },

    /// Frame is not a valid message.
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message to bytes.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(message)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(Bytes::from(payload))
}

/// Decode a message from bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid message.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    decode_with_limit(data, MAX_FRAME_SIZE)
}

/// Decode a message, rejecting frames larger than `max_size` bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid message.
pub fn decode_with_limit(data: &[u8], max_size: usize) -> Result<Message, ProtocolError> {
    let max = max_size.min(MAX_FRAME_SIZE);
    if data.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }

    Ok(serde_json::from_slice(data)?)
}
