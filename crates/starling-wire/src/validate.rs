//! Accumulating validators for inbound protocol frames.
//!
//! Validators operate on the parsed JSON value, before any typed
//! extraction. Every violation is collected; nothing short-circuits, so a
//! single pass surfaces everything wrong with a frame.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::limits::{MAX_ERROR_MESSAGE_LENGTH, PROTOCOL_NAME};
use crate::names::{validate_method_grammar, validate_topic_name};

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").unwrap());

/// Outcome of a validator: valid iff no errors were accumulated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Validation {
    pub errors: Vec<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn merge(&mut self, other: Validation) {
        self.errors.extend(other.errors);
    }
}

fn field<'v>(value: &'v Value, name: &str) -> Option<&'v Value> {
    value.as_object().and_then(|map| map.get(name))
}

fn check_uuid(v: &mut Validation, value: &Value, name: &str) {
    match value.as_str() {
        Some(s) if Uuid::parse_str(s).is_ok() => {}
        Some(s) => v.push(format!("{}: '{}' is not a valid UUID", name, s)),
        None => v.push(format!("{}: must be a string", name)),
    }
}

/// Validate the four universal envelope fields plus the `peer` marker.
///
/// When `peer` is absent it is defaulted to `false` on the given value,
/// so downstream code reads it uniformly.
pub fn validate_base(value: &mut Value) -> Validation {
    let mut v = Validation::ok();

    let Some(map) = value.as_object() else {
        return Validation::fail("message: must be a JSON object");
    };

    match map.get("protocol").and_then(Value::as_str) {
        Some(PROTOCOL_NAME) => {}
        Some(other) => v.push(format!("protocol: expected '{}', got '{}'", PROTOCOL_NAME, other)),
        None => v.push("protocol: missing or not a string"),
    }

    match map.get("version").and_then(Value::as_str) {
        Some(version) if VERSION_RE.is_match(version) => {}
        Some(version) => v.push(format!(
            "version: '{}' is not a MAJOR.MINOR.PATCH version",
            version
        )),
        None => v.push("version: missing or not a string"),
    }

    match map.get("timestamp") {
        Some(ts) if ts.as_u64().is_some() => {}
        Some(_) => v.push("timestamp: must be a non-negative integer (Unix milliseconds)"),
        None => v.push("timestamp: missing"),
    }

    match map.get("type") {
        Some(Value::String(t)) if !t.is_empty() => {}
        Some(_) => v.push("type: must be a non-empty string"),
        None => v.push("type: missing"),
    }

    let peer = match map.get("peer") {
        None => PeerField::Absent,
        Some(Value::Bool(false)) | Some(Value::Object(_)) => PeerField::Ok,
        Some(_) => PeerField::Bad,
    };
    match peer {
        // Normalize: absence is equivalent to `false`.
        PeerField::Absent => {
            value
                .as_object_mut()
                .unwrap()
                .insert("peer".to_string(), Value::Bool(false));
        }
        PeerField::Ok => {}
        PeerField::Bad => v.push("peer: must be false or a mapping"),
    }

    v
}

enum PeerField {
    Absent,
    Ok,
    Bad,
}

/// Validate the request-specific fields.
pub fn validate_request(value: &Value) -> Validation {
    let mut v = Validation::ok();

    match field(value, "requestId") {
        Some(id) => check_uuid(&mut v, id, "requestId"),
        None => v.push("requestId: missing"),
    }

    match field(value, "method").and_then(Value::as_str) {
        Some(method) => v.merge(validate_method_grammar(method)),
        None => v.push("method: missing or not a string"),
    }

    v
}

fn check_error_detail(v: &mut Validation, error: &Value, context: &str) {
    let Some(map) = error.as_object() else {
        v.push(format!("{}: must be an object", context));
        return;
    };

    match map.get("code").and_then(Value::as_str) {
        Some(code) if !code.is_empty() => {}
        Some(_) => v.push(format!("{}.code: must be a non-empty string", context)),
        None => v.push(format!("{}.code: missing or not a string", context)),
    }

    match map.get("message").and_then(Value::as_str) {
        Some(message) if message.is_empty() => {
            v.push(format!("{}.message: must be a non-empty string", context))
        }
        Some(message) if message.len() > MAX_ERROR_MESSAGE_LENGTH => v.push(format!(
            "{}.message: exceeds {} bytes",
            context, MAX_ERROR_MESSAGE_LENGTH
        )),
        Some(_) => {}
        None => v.push(format!("{}.message: missing or not a string", context)),
    }

    if let Some(details) = map.get("details") {
        if details.is_null() {
            v.push(format!("{}.details: must not be null when present", context));
        }
    }
}

/// Validate the response-specific fields.
pub fn validate_response(value: &Value) -> Validation {
    let mut v = Validation::ok();

    match field(value, "requestId") {
        Some(id) => check_uuid(&mut v, id, "requestId"),
        None => v.push("requestId: missing"),
    }

    match field(value, "success").and_then(Value::as_bool) {
        Some(true) => {
            if field(value, "error").is_some() {
                v.push("error: must be absent on a successful response");
            }
        }
        Some(false) => match field(value, "error") {
            Some(error) => check_error_detail(&mut v, error, "error"),
            None => v.push("error: required on a failure response"),
        },
        None => v.push("success: missing or not a boolean"),
    }

    v
}

/// Validate the notification-specific fields.
///
/// The topic grammar is only enforced for topic-routed notifications.
/// Correlated notifications (those carrying `requestId`) use
/// request-scoped channel names such as `{requestId}:progress` which are
/// addressed to the originating request, never to the topic registry.
pub fn validate_notification(value: &Value) -> Validation {
    let mut v = Validation::ok();

    let correlated = match field(value, "requestId") {
        Some(id) => {
            check_uuid(&mut v, id, "requestId");
            true
        }
        None => false,
    };

    match field(value, "notification") {
        Some(Value::Object(body)) => {
            if let Some(topic) = body.get("topic") {
                match topic.as_str() {
                    Some(topic) if !correlated => v.merge(validate_topic_name(topic)),
                    Some(_) => {}
                    None => v.push("notification.topic: must be a string"),
                }
            }
        }
        Some(_) => v.push("notification: must be an object"),
        None => v.push("notification: missing"),
    }

    v
}

/// Validate a top-level error message.
pub fn validate_error(value: &Value) -> Validation {
    let mut v = Validation::ok();

    match field(value, "error") {
        Some(error) => {
            check_error_detail(&mut v, error, "error");
            match error.get("severity").and_then(Value::as_str) {
                Some("protocol") | Some("application") => {}
                Some(other) => v.push(format!(
                    "error.severity: expected 'protocol' or 'application', got '{}'",
                    other
                )),
                None => v.push("error.severity: missing or not a string"),
            }
        }
        None => v.push("error: missing"),
    }

    v
}

/// Validate an ack message.
pub fn validate_ack(value: &Value) -> Validation {
    let mut v = Validation::ok();
    match field(value, "messageId") {
        Some(id) => check_uuid(&mut v, id, "messageId"),
        None => v.push("messageId: missing"),
    }
    v
}

/// Validate a ping message (envelope fields only).
pub fn validate_ping(_value: &Value) -> Validation {
    Validation::ok()
}

/// Validate a complete protocol frame: the universal envelope plus the
/// per-type invariants selected by its `type` field.
///
/// Unknown types are a violation here; the resolver may route them to the
/// JSON hook instead when custom types are allowed.
pub fn validate_message(value: &mut Value) -> Validation {
    let mut v = validate_base(value);

    match field(value, "type").and_then(Value::as_str) {
        Some("request") => v.merge(validate_request(value)),
        Some("response") => v.merge(validate_response(value)),
        Some("notification") => v.merge(validate_notification(value)),
        Some("error") => v.merge(validate_error(value)),
        Some("ack") => v.merge(validate_ack(value)),
        Some("ping") => v.merge(validate_ping(value)),
        Some(other) => v.push(format!("type: unknown message type '{}'", other)),
        None => {} // already reported by validate_base
    }

    v
}
