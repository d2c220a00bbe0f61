//! Inbound frame classification and typed dispatch.
//!
//! [`resolve`] classifies a raw frame exactly once; the returned
//! [`Resolution`] exposes chained, synchronous subscription methods that
//! run in declaration order against the classified frame. A violation
//! list suppresses every typed callback and fires `on_violation`
//! instead. The resolver never blocks and never panics toward the
//! transport: unparseable text is text, foreign JSON is JSON.

use bytes::Bytes;
use serde_json::Value;
use starling_wire::{
    decode, validate_message, version_compatible, Decoded, Message, MessageKind, RawFrame,
    DEFAULT_MAX_MESSAGE_SIZE, ErrorCode, PROTOCOL_VERSION,
};

#[derive(Clone, Debug)]
pub struct ResolveOptions {
    /// Treat version-class mismatches as violations.
    pub strict: bool,
    /// Route protocol frames with unknown `type` values to the JSON
    /// hook instead of rejecting them.
    pub allow_custom_types: bool,
    pub max_message_size: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            strict: true,
            allow_custom_types: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// The classified frame, when classification succeeded.
#[derive(Clone, Debug)]
pub enum ClassifiedFrame {
    Binary(Bytes),
    Text(String),
    Json(Value),
    Protocol(Message),
}

/// Owned pieces of a resolution, for callers that dispatch by matching
/// rather than through the subscription methods.
pub struct ResolutionParts {
    pub frame: Option<ClassifiedFrame>,
    pub violations: Vec<String>,
    pub version_mismatch: bool,
}

/// Result of classifying one frame.
pub struct Resolution {
    frame: Option<ClassifiedFrame>,
    violations: Vec<String>,
    version_mismatch: bool,
}

/// Classify one raw frame against the given options.
pub fn resolve(raw: RawFrame, opts: &ResolveOptions) -> Resolution {
    if raw.len() > opts.max_message_size {
        return Resolution {
            frame: None,
            violations: vec![format!(
                "message exceeds maximum size ({} > {} bytes)",
                raw.len(),
                opts.max_message_size
            )],
            version_mismatch: false,
        };
    }

    match decode(raw) {
        Decoded::Binary(bytes) => Resolution::of(ClassifiedFrame::Binary(bytes)),
        Decoded::Text(text) => Resolution::of(ClassifiedFrame::Text(text)),
        Decoded::Foreign(value) => Resolution::of(ClassifiedFrame::Json(value)),
        Decoded::Protocol(mut value) => {
            if opts.allow_custom_types && has_unknown_type(&value) {
                return Resolution::of(ClassifiedFrame::Json(value));
            }

            let validation = validate_message(&mut value);
            if !validation.is_valid() {
                return Resolution {
                    frame: None,
                    violations: validation.errors,
                    version_mismatch: false,
                };
            }

            let version = value
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if !version_compatible(&version, PROTOCOL_VERSION) {
                if opts.strict {
                    return Resolution {
                        frame: None,
                        violations: vec![format!(
                            "version: '{}' is not wire-compatible with '{}'",
                            version, PROTOCOL_VERSION
                        )],
                        version_mismatch: true,
                    };
                }
                tracing::warn!(theirs = %version, ours = PROTOCOL_VERSION, "version class mismatch tolerated");
            }

            match Message::from_value(value) {
                Ok(message) => Resolution::of(ClassifiedFrame::Protocol(message)),
                Err(err) => Resolution {
                    frame: None,
                    violations: vec![format!("invalid message: {}", err)],
                    version_mismatch: false,
                },
            }
        }
    }
}

fn has_unknown_type(value: &Value) -> bool {
    match value.get("type").and_then(Value::as_str) {
        Some("request" | "response" | "notification" | "error" | "ack" | "ping") => false,
        Some(_) => true,
        None => false,
    }
}

impl Resolution {
    fn of(frame: ClassifiedFrame) -> Self {
        Self {
            frame: Some(frame),
            violations: Vec::new(),
            version_mismatch: false,
        }
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// The error code an outbound violation report should carry.
    pub fn violation_code(&self) -> ErrorCode {
        if self.version_mismatch {
            ErrorCode::ProtocolVersionMismatch
        } else {
            ErrorCode::ProtocolViolation
        }
    }

    pub fn frame(&self) -> Option<&ClassifiedFrame> {
        self.frame.as_ref()
    }

    pub fn into_parts(self) -> ResolutionParts {
        ResolutionParts {
            frame: self.frame,
            violations: self.violations,
            version_mismatch: self.version_mismatch,
        }
    }

    fn clean_frame(&self) -> Option<&ClassifiedFrame> {
        if self.violations.is_empty() {
            self.frame.as_ref()
        } else {
            None
        }
    }

    fn message_if(&self, want: fn(&MessageKind) -> bool) -> Option<&Message> {
        match self.clean_frame() {
            Some(ClassifiedFrame::Protocol(message)) if want(&message.kind) => Some(message),
            _ => None,
        }
    }

    pub fn on_binary(self, f: impl FnOnce(&Bytes)) -> Self {
        if let Some(ClassifiedFrame::Binary(bytes)) = self.clean_frame() {
            f(bytes);
        }
        self
    }

    pub fn on_text(self, f: impl FnOnce(&str)) -> Self {
        if let Some(ClassifiedFrame::Text(text)) = self.clean_frame() {
            f(text);
        }
        self
    }

    pub fn on_json(self, f: impl FnOnce(&Value)) -> Self {
        if let Some(ClassifiedFrame::Json(value)) = self.clean_frame() {
            f(value);
        }
        self
    }

    pub fn on_request(self, f: impl FnOnce(&Message)) -> Self {
        if let Some(message) = self.message_if(|k| matches!(k, MessageKind::Request { .. })) {
            f(message);
        }
        self
    }

    pub fn on_response(self, f: impl FnOnce(&Message)) -> Self {
        if let Some(message) = self.message_if(|k| matches!(k, MessageKind::Response { .. })) {
            f(message);
        }
        self
    }

    pub fn on_notification(self, f: impl FnOnce(&Message)) -> Self {
        if let Some(message) = self.message_if(|k| matches!(k, MessageKind::Notification { .. })) {
            f(message);
        }
        self
    }

    pub fn on_ack(self, f: impl FnOnce(&Message)) -> Self {
        if let Some(message) = self.message_if(|k| matches!(k, MessageKind::Ack { .. })) {
            f(message);
        }
        self
    }

    pub fn on_ping(self, f: impl FnOnce(&Message)) -> Self {
        if let Some(message) = self.message_if(|k| matches!(k, MessageKind::Ping)) {
            f(message);
        }
        self
    }

    pub fn on_error_message(self, f: impl FnOnce(&Message)) -> Self {
        if let Some(message) = self.message_if(|k| matches!(k, MessageKind::Error { .. })) {
            f(message);
        }
        self
    }

    pub fn on_violation(self, f: impl FnOnce(&[String])) -> Self {
        if !self.violations.is_empty() {
            f(&self.violations);
        }
        self
    }
}
