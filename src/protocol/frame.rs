//! Wire envelope codec.
//!
//! Every message in either direction is one JSON object:
//! `{ver, cmd, seq, opcode, payload}`. Responses echo the request seq;
//! server-initiated notifications carry a seq that is not in the pending
//! table (typically 0).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode frame: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode frame: {0}")]
    Decode(serde_json::Error),
}

/// The MP wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub ver: i32,
    pub cmd: i32,
    #[serde(default)]
    pub seq: u32,
    pub opcode: i32,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    /// Build a request frame (cmd is always 0 for client-originated traffic).
    pub fn request(ver: i32, seq: u32, opcode: i32, payload: Value) -> Self {
        Self {
            ver,
            cmd: 0,
            seq,
            opcode,
            payload,
        }
    }

    /// Serialize to the wire text representation.
    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }

    /// Parse a frame from wire text.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(FrameError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = Frame::request(11, 7, 64, json!({"chatId": 42, "message": {"text": "hi"}}));
        let text = frame.encode().unwrap();
        let back = Frame::decode(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_decode_notification_without_seq() {
        let back = Frame::decode(r#"{"ver":11,"cmd":0,"opcode":128,"payload":{"chatId":1}}"#)
            .unwrap();
        assert_eq!(back.seq, 0);
        assert_eq!(back.opcode, 128);
    }

    #[test]
    fn test_decode_missing_payload_defaults_to_null() {
        let back = Frame::decode(r#"{"ver":11,"cmd":1,"seq":3,"opcode":1}"#).unwrap();
        assert!(back.payload.is_null());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Frame::decode("not json").is_err());
    }

    #[test]
    fn test_unknown_envelope_fields_are_tolerated() {
        let back =
            Frame::decode(r#"{"ver":11,"cmd":1,"seq":3,"opcode":1,"payload":{},"extra":true}"#)
                .unwrap();
        assert_eq!(back.seq, 3);
    }
}
