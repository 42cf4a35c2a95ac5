//! Wire protocol for the pooled raw-socket backend
//!
//! Frames are UTF-8 JSON with a flat `type` tag. Outbound bursts above the
//! configured threshold are sent as a single binary envelope instead: a
//! 2-byte magic header followed by a zlib-compressed JSON array of frames.
//! Decoding branches on the magic header.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RealtimeError, RealtimeResult};

/// Magic header marking a compressed binary batch envelope
pub const BINARY_MAGIC: [u8; 2] = [0xFF, 0xFE];

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// Client requests delivery for a channel
    Subscribe { channel: String },

    /// Client stops delivery for a channel
    Unsubscribe { channel: String },

    /// An application event on a channel
    Message {
        channel: String,
        event: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Latency probe; the peer answers with a pong carrying the same timestamp
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Latency probe answer
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Server acknowledgement of a subscribe; `data` may seed a presence roster
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Server-side error report
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl WireMessage {
    /// Build a `Message` frame stamped with the current wall-clock time
    pub fn message(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self::Message {
            channel: channel.into(),
            event: event.into(),
            data,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Serialize this frame to a JSON text payload
    pub fn to_text(&self) -> RealtimeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a single JSON text frame
    pub fn from_text(text: &str) -> RealtimeResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Encode a batch of frames as a magic-tagged, zlib-compressed envelope
pub fn encode_batch(messages: &[WireMessage]) -> RealtimeResult<Vec<u8>> {
    let json = serde_json::to_vec(messages)?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(&json)
        .map_err(|e| RealtimeError::ConnectionFailed(format!("compress error: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| RealtimeError::ConnectionFailed(format!("compress finish: {e}")))?;

    let mut envelope = Vec::with_capacity(compressed.len() + BINARY_MAGIC.len());
    envelope.extend_from_slice(&BINARY_MAGIC);
    envelope.extend_from_slice(&compressed);
    Ok(envelope)
}

/// Decode an inbound binary payload, branching on the magic header
///
/// Payloads without the magic header are treated as plain UTF-8 JSON holding
/// a single frame.
pub fn decode_frame(bytes: &[u8]) -> RealtimeResult<Vec<WireMessage>> {
    if bytes.starts_with(&BINARY_MAGIC) {
        let mut decoder = ZlibDecoder::new(&bytes[BINARY_MAGIC.len()..]);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| RealtimeError::Parse(format!("decompress error: {e}")))?;
        Ok(serde_json::from_slice(&json)?)
    } else {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RealtimeError::Parse(format!("invalid utf-8 frame: {e}")))?;
        Ok(vec![WireMessage::from_text(text)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_frame_shape() {
        let frame = WireMessage::Message {
            channel: "tournament-42".to_string(),
            event: "score-update".to_string(),
            data: json!({"matchId": "m1", "teamId": "t1", "points": 3}),
            timestamp: Some(1_700_000_000_000),
        };

        let text = frame.to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["channel"], "tournament-42");
        assert_eq!(value["event"], "score-update");
        assert_eq!(value["data"]["points"], 3);
    }

    #[test]
    fn test_ping_omits_absent_timestamp() {
        let text = WireMessage::Ping { timestamp: None }.to_text().unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_parse_subscribe() {
        let frame = WireMessage::from_text(r#"{"type":"subscribe","channel":"match-m1"}"#).unwrap();
        assert_eq!(
            frame,
            WireMessage::Subscribe {
                channel: "match-m1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!(WireMessage::from_text(r#"{"type":"mystery"}"#).is_err());
    }

    #[test]
    fn test_binary_envelope_round_trip() {
        let batch: Vec<WireMessage> = (0..25)
            .map(|i| WireMessage::message("tournament-42", "score-update", json!({"seq": i})))
            .collect();

        let envelope = encode_batch(&batch).unwrap();
        assert_eq!(&envelope[..2], &BINARY_MAGIC);

        let decoded = decode_frame(&envelope).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_decode_plain_text_frame() {
        let text = r#"{"type":"pong","timestamp":42}"#;
        let decoded = decode_frame(text.as_bytes()).unwrap();
        assert_eq!(decoded, vec![WireMessage::Pong { timestamp: Some(42) }]);
    }

    #[test]
    fn test_decode_corrupt_envelope_fails() {
        let garbage = [0xFF, 0xFE, 0x00, 0x01, 0x02];
        assert!(decode_frame(&garbage).is_err());
    }

    #[test]
    fn test_decode_failures_classify_as_parse_errors() {
        // Corrupt zlib behind a valid magic header
        let garbage = [0xFF, 0xFE, 0x00, 0x01, 0x02];
        assert!(matches!(
            decode_frame(&garbage),
            Err(RealtimeError::Parse(_))
        ));

        // Invalid UTF-8 without the magic header
        assert!(matches!(
            decode_frame(&[0xC0, 0x80]),
            Err(RealtimeError::Parse(_))
        ));

        // Valid UTF-8 that is not a frame
        assert!(matches!(
            WireMessage::from_text("not json"),
            Err(RealtimeError::Parse(_))
        ));
    }

    #[test]
    fn test_envelope_compresses_repetitive_batches() {
        let batch: Vec<WireMessage> = (0..200)
            .map(|_| WireMessage::message("tournament-42", "score-update", json!({"points": 3})))
            .collect();

        let envelope = encode_batch(&batch).unwrap();
        let plain: usize = batch.iter().map(|m| m.to_text().unwrap().len()).sum();
        assert!(envelope.len() < plain / 4);
    }
}
