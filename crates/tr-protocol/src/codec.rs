//! Text codec for frames
//!
//! Frames travel as WebSocket text messages. Decoding is staged so callers can
//! tell a broken payload apart from a well-formed frame of an unknown type or
//! one with missing fields.

use serde_json::Value;

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameType};

/// Maximum accepted frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

impl Frame {
    /// Decode a frame from its JSON text form
    pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        let frame_type =
            FrameType::parse(tag).ok_or_else(|| ProtocolError::UnknownType(tag.to_string()))?;

        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidFields {
            frame_type: frame_type.as_str(),
            source,
        })
    }

    /// Encode a frame into its JSON text form
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}
