//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding or encoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame text is not valid JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Frame has no string `type` discriminator
    #[error("Frame is missing a `type` field")]
    MissingType,

    /// Frame names a type outside the vocabulary
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// Frame type is known but its fields do not match
    #[error("Invalid `{frame_type}` frame: {source}")]
    InvalidFields {
        frame_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Frame text exceeds the maximum size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialization error
    #[error("Failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}
