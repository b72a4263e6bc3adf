//! Codec trait and the JSON implementation.
//!
//! Every byte that crosses a socket or the broker goes through a
//! [`Codec`]. Workers hold one codec value and share it between the
//! connection tasks and the fan-out handler.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to bytes and decodes them back.
///
/// `Send + Sync + 'static` because a single codec instance is shared by
/// every task of a worker for the lifetime of the process.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes into an owned value.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

/// A [`Codec`] backed by `serde_json`.
///
/// JSON is what browser clients speak natively, so it is both the
/// connection codec and the broker codec.
///
/// ```rust
/// use cohort_protocol::{ClientMessage, Codec, JsonCodec};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&ClientMessage::Join { room: "lobby".into() }).unwrap();
/// let back: ClientMessage = codec.decode(&bytes).unwrap();
/// assert_eq!(back, ClientMessage::Join { room: "lobby".into() });
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Delivery, Recipient, SessionId};

    #[test]
    fn test_decode_garbage_returns_decode_error() {
        let result: Result<Delivery, _> = JsonCodec.decode(b"not json at all");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_encode_delivery_is_plain_json() {
        let delivery = Delivery {
            to: Recipient::Session(SessionId::new("abc")),
            event: "ping".into(),
            data: serde_json::json!({ "n": 1 }),
        };

        let bytes = JsonCodec.encode(&delivery).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["to"]["Session"], "abc");
        assert_eq!(json["event"], "ping");
        assert_eq!(json["data"]["n"], 1);
    }
}
