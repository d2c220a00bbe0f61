//! Kernel error taxonomy and wire error bodies.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of error codes the kernel itself produces.
///
/// Application handlers are free to reply with arbitrary string codes;
/// those travel as opaque `String`s in [`ErrorDetail`]. This enum covers
/// only the codes the runtime emits on its own behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ProtocolInvalidMessage,
    ProtocolVersionMismatch,
    ProtocolViolation,
    MethodNotFound,
    MethodError,
    RequestInvalid,
    RequestTimeout,
    RequestCancelled,
    QueueRetryExceeded,
    QueueDrainTimeout,
    ValidationError,
    InternalError,
    ProxyForbidden,
    ProxyTimeout,
    ProxyError,
}

impl ErrorCode {
    /// The wire spelling of this code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ProtocolInvalidMessage => "PROTOCOL_INVALID_MESSAGE",
            ErrorCode::ProtocolVersionMismatch => "PROTOCOL_VERSION_MISMATCH",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::MethodError => "METHOD_ERROR",
            ErrorCode::RequestInvalid => "REQUEST_INVALID",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::RequestCancelled => "REQUEST_CANCELLED",
            ErrorCode::QueueRetryExceeded => "QUEUE_RETRY_EXCEEDED",
            ErrorCode::QueueDrainTimeout => "QUEUE_DRAIN_TIMEOUT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ProxyForbidden => "PROXY_FORBIDDEN",
            ErrorCode::ProxyTimeout => "PROXY_TIMEOUT",
            ErrorCode::ProxyError => "PROXY_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str().to_string()
    }
}

/// Severity of a top-level `error` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The peer violated the wire protocol itself.
    Protocol,
    /// An application- or kernel-level failure not tied to one request.
    Application,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Protocol => f.write_str("protocol"),
            Severity::Application => f.write_str("application"),
        }
    }
}

/// Error body carried by a failure `response`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Error body carried by a top-level `error` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Failures raised by the codec itself.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("message serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message exceeds maximum size ({size} > {limit} bytes)")]
    Oversize { size: usize, limit: usize },

    #[error("invalid message: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_spelling() {
        assert_eq!(ErrorCode::ProtocolViolation.as_str(), "PROTOCOL_VIOLATION");
        assert_eq!(ErrorCode::MethodNotFound.as_str(), "METHOD_NOT_FOUND");
        assert_eq!(ErrorCode::RequestTimeout.as_str(), "REQUEST_TIMEOUT");
        assert_eq!(ErrorCode::QueueRetryExceeded.as_str(), "QUEUE_RETRY_EXCEEDED");
        assert_eq!(ErrorCode::ProxyError.as_str(), "PROXY_ERROR");
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Severity::Protocol).unwrap(),
            "\"protocol\""
        );
        assert_eq!(
            serde_json::to_string(&Severity::Application).unwrap(),
            "\"application\""
        );
    }

    #[test]
    fn error_detail_omits_absent_details() {
        let detail = ErrorDetail::new("SOME_CODE", "it failed");
        let json = serde_json::to_string(&detail).unwrap();
        assert!(!json.contains("details"));

        let detail = detail.with_details(serde_json::json!({"hint": 42}));
        let json = serde_json::to_string(&detail).unwrap();
        assert!(json.contains("details"));
    }
}
