//! Codec trait and implementations for serializing/deserializing messages.
//!
//! The router and the connection handler never call `serde_json` directly;
//! they go through a [`Codec`], so the wire format can change without
//! touching them.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// Encodes values to bytes and decodes bytes back.
///
/// `DeserializeOwned` (rather than `Deserialize<'de>`) because decoded
/// frames outlive the receive buffer they came from.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ```rust
/// use ensemble_protocol::{ClientFrame, Codec, JsonCodec};
///
/// let codec = JsonCodec;
/// let frame: ClientFrame = codec.decode(br#"{"type":"Typing","is_typing":true}"#).unwrap();
/// assert_eq!(frame, ClientFrame::Typing { is_typing: true });
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{ClientFrame, Envelope, ServerEvent, UserId};

    #[test]
    fn test_json_codec_decode_unknown_frame_type_fails() {
        let codec = JsonCodec;
        let result: Result<ClientFrame, _> = codec.decode(br#"{"type":"Teleport"}"#);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_json_codec_decode_garbage_fails() {
        let codec = JsonCodec;
        let result: Result<ClientFrame, _> = codec.decode(b"\xff\x00not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_json_codec_encodes_envelope_as_utf8() {
        let codec = JsonCodec;
        let bytes = codec
            .encode(&Envelope::direct(ServerEvent::Left { user_id: UserId(9) }))
            .unwrap();
        let text = std::str::from_utf8(&bytes).expect("json is utf-8");
        assert!(text.contains("\"Left\""));
    }
}
