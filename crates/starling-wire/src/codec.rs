//! Encoding, decoding, and first-stage classification of raw frames.

use bytes::Bytes;
use serde_json::Value;

use crate::error::WireError;
use crate::limits::PROTOCOL_NAME;
use crate::message::Message;

/// One frame as handed over by (or to) the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

impl RawFrame {
    /// Byte length of the frame on the wire.
    pub fn len(&self) -> usize {
        match self {
            RawFrame::Text(s) => s.len(),
            RawFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for RawFrame {
    fn from(s: String) -> Self {
        RawFrame::Text(s)
    }
}

impl From<&str> for RawFrame {
    fn from(s: &str) -> Self {
        RawFrame::Text(s.to_string())
    }
}

impl From<Bytes> for RawFrame {
    fn from(b: Bytes) -> Self {
        RawFrame::Binary(b)
    }
}

/// First-stage classification of an inbound frame.
///
/// Binary frames pass through opaquely. Text frames that fail to parse
/// stay text; parsed JSON without the protocol marker is foreign; only
/// frames carrying `protocol == "helios-starling"` are protocol-bearing
/// (and still subject to validation).
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Binary(Bytes),
    Text(String),
    Foreign(Value),
    Protocol(Value),
}

/// Classify one raw frame. Never fails: unparseable input is simply text.
pub fn decode(raw: RawFrame) -> Decoded {
    match raw {
        RawFrame::Binary(bytes) => Decoded::Binary(bytes),
        RawFrame::Text(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => {
                let is_protocol = value
                    .get("protocol")
                    .and_then(Value::as_str)
                    .map(|p| p == PROTOCOL_NAME)
                    .unwrap_or(false);
                if is_protocol {
                    Decoded::Protocol(value)
                } else {
                    Decoded::Foreign(value)
                }
            }
            Err(_) => Decoded::Text(text),
        },
    }
}

/// Serialize a message as compact JSON.
pub fn encode(message: &Message) -> Result<String, WireError> {
    serde_json::to_string(message).map_err(WireError::Json)
}

/// UTF-8 byte length of the serialized form.
pub fn encoded_size(message: &Message) -> Result<usize, WireError> {
    encode(message).map(|s| s.len())
}

/// Whether two protocol versions are wire-compatible: same MAJOR class.
///
/// Unparseable versions are never compatible; the validators report the
/// malformed field separately.
pub fn version_compatible(theirs: &str, ours: &str) -> bool {
    match (semver::Version::parse(theirs), semver::Version::parse(ours)) {
        (Ok(a), Ok(b)) => a.major == b.major,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::PROTOCOL_VERSION;
    use crate::validate::validate_message;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn binary_passes_through() {
        let frame = RawFrame::Binary(Bytes::from_static(b"\x00\x01\x02"));
        assert_eq!(
            decode(frame),
            Decoded::Binary(Bytes::from_static(b"\x00\x01\x02"))
        );
    }

    #[test]
    fn unparseable_text_stays_text() {
        assert_eq!(
            decode(RawFrame::from("hello there")),
            Decoded::Text("hello there".to_string())
        );
        assert_eq!(
            decode(RawFrame::from("{not json")),
            Decoded::Text("{not json".to_string())
        );
    }

    #[test]
    fn foreign_json_is_not_protocol() {
        match decode(RawFrame::from(r#"{"jsonrpc": "2.0", "id": 1}"#)) {
            Decoded::Foreign(value) => assert_eq!(value["jsonrpc"], "2.0"),
            other => panic!("expected foreign, got {:?}", other),
        }
    }

    #[test]
    fn protocol_marker_selects_protocol_class() {
        let text = r#"{"protocol": "helios-starling", "version": "1.0.0"}"#;
        assert!(matches!(decode(RawFrame::from(text)), Decoded::Protocol(_)));

        let text = r#"{"protocol": "other-proto"}"#;
        assert!(matches!(decode(RawFrame::from(text)), Decoded::Foreign(_)));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let id = Uuid::new_v4();
        let messages = vec![
            Message::request(id, "users:getProfile", Some(json!({"userId": "123"}))),
            Message::response_success(id, Some(json!({"name": "John"}))),
            Message::response_failure(
                id,
                crate::ErrorDetail::new("METHOD_NOT_FOUND", "no such method"),
            ),
            Message::notification(
                Some("user:presence".into()),
                Some(json!({"online": true})),
                None,
            ),
            Message::notification(None, Some(json!({"type": "progress", "progress": 50})), Some(id)),
            Message::error(
                crate::Severity::Protocol,
                "PROTOCOL_VIOLATION",
                "bad frame",
                None,
            ),
            Message::ack(id),
            Message::ping(),
        ];

        for original in messages {
            let encoded = encode(&original).unwrap();
            let Decoded::Protocol(mut value) = decode(RawFrame::from(encoded)) else {
                panic!("round-trip lost protocol class");
            };
            let v = validate_message(&mut value);
            assert!(v.is_valid(), "{:?}", v.errors);
            let decoded = Message::from_value(value).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn payloads_survive_verbatim() {
        let payload = json!({
            "nested": {"deep": [1, 2.5, "three", null, true]},
            "unicode": "héllo 世界",
        });
        let msg = Message::request(Uuid::new_v4(), "data:sync", Some(payload.clone()));
        let encoded = encode(&msg).unwrap();
        let Decoded::Protocol(value) = decode(RawFrame::from(encoded)) else {
            panic!();
        };
        let decoded = Message::from_value(value).unwrap();
        match decoded.kind {
            crate::MessageKind::Request { payload: Some(p), .. } => assert_eq!(p, payload),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn size_is_utf8_byte_length() {
        let msg = Message::notification(
            Some("chat:message".into()),
            Some(json!({"text": "héllo"})),
            None,
        );
        let encoded = encode(&msg).unwrap();
        assert_eq!(encoded_size(&msg).unwrap(), encoded.len());
        assert!(encoded_size(&msg).unwrap() > encoded.chars().count());
    }

    #[test]
    fn version_compatibility_is_major_equality() {
        assert!(version_compatible("1.0.0", PROTOCOL_VERSION));
        assert!(version_compatible("1.9.3", "1.0.0"));
        assert!(!version_compatible("2.0.0", "1.0.0"));
        assert!(!version_compatible("1.0", "1.0.0"));
        assert!(!version_compatible("abc", "1.0.0"));
    }
}
