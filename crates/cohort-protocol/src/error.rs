//! Error types for the protocol layer.

/// Errors raised while encoding or decoding protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing fields, or an
    /// unknown message `type` tag.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The value decoded fine but breaks a protocol rule, e.g. an empty
    /// room name.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
