//! The protocol envelope and its per-type bodies.
//!
//! Every protocol frame shares four universal fields (`protocol`,
//! `version`, `timestamp`, `type`) plus the optional `peer` relay marker
//! and optional free-form `metadata`. The per-type fields live in
//! [`MessageKind`], tagged by the `type` field on the wire. Payloads are
//! dynamic [`serde_json::Value`]s end to end; the kernel never interprets
//! them beyond the invariants in the validators.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ErrorBody, ErrorDetail, Severity, WireError};
use crate::limits::{PROTOCOL_NAME, PROTOCOL_VERSION};

/// Relay marker on an envelope.
///
/// `Local` frames (`peer` absent or `false`) are executed by the
/// receiving node; `Relayed` frames carry a free-form mapping identifying
/// the third party they are being proxied for, and are handed to the
/// node's proxy hooks instead.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Peer {
    #[default]
    Local,
    Relayed(Map<String, Value>),
}

impl Peer {
    pub fn is_local(&self) -> bool {
        matches!(self, Peer::Local)
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, Peer::Relayed(_))
    }
}

impl Serialize for Peer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Peer::Local => serializer.serialize_bool(false),
            Peer::Relayed(map) => map.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Peer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PeerVisitor;

        impl<'de> Visitor<'de> for PeerVisitor {
            type Value = Peer;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("false or a mapping")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Peer, E> {
                if v {
                    Err(E::custom("peer: must be false or a mapping"))
                } else {
                    Ok(Peer::Local)
                }
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Peer, A::Error> {
                let mut map = Map::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    map.insert(key, value);
                }
                Ok(Peer::Relayed(map))
            }
        }

        deserializer.deserialize_any(PeerVisitor)
    }
}

/// Body of a notification message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl NotificationBody {
    /// The notification's discriminator: the `type` field inside `data`,
    /// when present. `"progress"` selects the progress listener path on a
    /// correlated request.
    pub fn kind(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.get("type"))
            .and_then(Value::as_str)
    }

    pub fn is_progress(&self) -> bool {
        self.kind() == Some("progress")
    }
}

/// Per-type fields of a protocol message, tagged by `type` on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageKind {
    Request {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Response {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDetail>,
    },
    Notification {
        notification: NotificationBody,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
    },
    Error {
        error: ErrorBody,
    },
    Ack {
        #[serde(rename = "messageId")]
        message_id: Uuid,
    },
    Ping,
}

impl MessageKind {
    /// The wire spelling of the `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::Request { .. } => "request",
            MessageKind::Response { .. } => "response",
            MessageKind::Notification { .. } => "notification",
            MessageKind::Error { .. } => "error",
            MessageKind::Ack { .. } => "ack",
            MessageKind::Ping => "ping",
        }
    }
}

/// A complete protocol message: envelope plus typed body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub protocol: String,
    pub version: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Peer::is_local")]
    pub peer: Peer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl Message {
    fn envelope(kind: MessageKind) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            timestamp: unix_ms(),
            peer: Peer::Local,
            metadata: None,
            kind,
        }
    }

    pub fn request(request_id: Uuid, method: impl Into<String>, payload: Option<Value>) -> Self {
        Self::envelope(MessageKind::Request {
            request_id,
            method: method.into(),
            payload,
        })
    }

    pub fn response_success(request_id: Uuid, data: Option<Value>) -> Self {
        Self::envelope(MessageKind::Response {
            request_id,
            success: true,
            data,
            error: None,
        })
    }

    pub fn response_failure(request_id: Uuid, error: ErrorDetail) -> Self {
        Self::envelope(MessageKind::Response {
            request_id,
            success: false,
            data: None,
            error: Some(error),
        })
    }

    /// Build a notification. Argument order is fixed as
    /// `(topic, data, request_id)`; a `Some` request id correlates the
    /// notification to an outstanding request on the receiving side.
    pub fn notification(
        topic: Option<String>,
        data: Option<Value>,
        request_id: Option<Uuid>,
    ) -> Self {
        Self::envelope(MessageKind::Notification {
            notification: NotificationBody { topic, data },
            request_id,
        })
    }

    pub fn error(
        severity: Severity,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self::envelope(MessageKind::Error {
            error: ErrorBody {
                severity,
                code: code.into(),
                message: message.into(),
                details,
            },
        })
    }

    pub fn ack(message_id: Uuid) -> Self {
        Self::envelope(MessageKind::Ack { message_id })
    }

    pub fn ping() -> Self {
        Self::envelope(MessageKind::Ping)
    }

    pub fn with_peer(mut self, peer: Peer) -> Self {
        self.peer = peer;
        self
    }

    /// The request id this message is bound to, if any. Responses and
    /// requests always carry one; notifications only when correlated.
    pub fn request_id(&self) -> Option<Uuid> {
        match &self.kind {
            MessageKind::Request { request_id, .. } => Some(*request_id),
            MessageKind::Response { request_id, .. } => Some(*request_id),
            MessageKind::Notification { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Typed extraction from an already-validated JSON value.
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        serde_json::from_value(value).map_err(WireError::Json)
    }

    pub fn to_value(&self) -> Result<Value, WireError> {
        serde_json::to_value(self).map_err(WireError::Json)
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_with_wire_field_names() {
        let id = Uuid::parse_str("123e4567-e89b-12d3-a456-426614174000").unwrap();
        let msg = Message::request(id, "users:getProfile", Some(json!({"userId": "123"})));
        let value = msg.to_value().unwrap();

        assert_eq!(value["protocol"], "helios-starling");
        assert_eq!(value["type"], "request");
        assert_eq!(value["requestId"], "123e4567-e89b-12d3-a456-426614174000");
        assert_eq!(value["method"], "users:getProfile");
        assert_eq!(value["payload"]["userId"], "123");
        // Local peer and absent metadata are omitted on the wire.
        assert!(value.get("peer").is_none());
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn peer_false_roundtrips_to_local() {
        let raw = json!({
            "protocol": "helios-starling",
            "version": "1.0.0",
            "timestamp": 12345,
            "type": "ping",
            "peer": false,
        });
        let msg = Message::from_value(raw).unwrap();
        assert!(msg.peer.is_local());

        let raw = json!({
            "protocol": "helios-starling",
            "version": "1.0.0",
            "timestamp": 12345,
            "type": "ping",
            "peer": {"origin": "node-7"},
        });
        let msg = Message::from_value(raw).unwrap();
        assert!(msg.peer.is_relayed());
    }

    #[test]
    fn peer_true_is_rejected() {
        let raw = json!({
            "protocol": "helios-starling",
            "version": "1.0.0",
            "timestamp": 12345,
            "type": "ping",
            "peer": true,
        });
        assert!(Message::from_value(raw).is_err());
    }

    #[test]
    fn notification_kind_reads_data_type() {
        let body = NotificationBody {
            topic: Some("job:progress".into()),
            data: Some(json!({"type": "progress", "progress": 25})),
        };
        assert!(body.is_progress());

        let body = NotificationBody {
            topic: Some("user:presence".into()),
            data: Some(json!({"online": true})),
        };
        assert_eq!(body.kind(), None);
    }

    #[test]
    fn response_failure_carries_error_detail() {
        let id = Uuid::new_v4();
        let msg = Message::response_failure(id, ErrorDetail::new("METHOD_NOT_FOUND", "no such method"));
        let value = msg.to_value().unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "METHOD_NOT_FOUND");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn ping_is_just_the_envelope() {
        let value = Message::ping().to_value().unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value.as_object().unwrap().len(), 4);
    }

    #[test]
    fn request_id_accessor_covers_correlated_kinds() {
        let id = Uuid::new_v4();
        assert_eq!(Message::request(id, "a:b", None).request_id(), Some(id));
        assert_eq!(Message::response_success(id, None).request_id(), Some(id));
        assert_eq!(
            Message::notification(Some("t".into()), None, Some(id)).request_id(),
            Some(id)
        );
        assert_eq!(
            Message::notification(Some("t".into()), None, None).request_id(),
            None
        );
        assert_eq!(Message::ping().request_id(), None);
    }
}
