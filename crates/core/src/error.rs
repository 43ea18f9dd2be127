//! Error types for the taskloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Each bounded context
//! has its own enum; anything that crosses into a conversation turn or a run
//! result is flattened into an [`ErrorPayload`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error codes carried by [`ErrorPayload`].
pub struct ErrorCode;

impl ErrorCode {
    pub const VALIDATION_ERROR: &'static str = "VALIDATION_ERROR";
    pub const CONFLICT: &'static str = "CONFLICT";
    pub const NOT_FOUND: &'static str = "NOT_FOUND";
    pub const UNAUTHORIZED: &'static str = "UNAUTHORIZED";
    pub const INTERNAL: &'static str = "INTERNAL";
    pub const PROTOCOL_ERROR: &'static str = "PROTOCOL_ERROR";
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const CANCELLED_BY_USER: &'static str = "CANCELLED_BY_USER";
}

/// The `{code, message, details}` triple every failure is normalised into
/// before it is placed into a tool message or a run result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach one detail entry, creating the map on first use.
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    /// Interpret an arbitrary tool-reported error object.
    ///
    /// Tool servers are loose about the shape: `code` may be missing in
    /// favour of `type`, and `message` may be absent entirely.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::new(
                ErrorCode::UNKNOWN,
                "Tool returned failure without error payload",
            );
        };
        let code = map
            .get("code")
            .or_else(|| map.get("type"))
            .and_then(value_as_text)
            .unwrap_or_else(|| ErrorCode::UNKNOWN.to_string());
        let message = map
            .get("message")
            .and_then(value_as_text)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| code.clone());
        let details = map.get("details").and_then(|d| d.as_object()).cloned();
        Self {
            code,
            message,
            details,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn value_as_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors raised by an LLM or tool backend at the transport level.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Backend not ready: {0}")]
    NotReady(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    /// A backend that already speaks the structured error shape.
    #[error("{0}")]
    Structured(ErrorPayload),
}

impl GatewayError {
    /// Short variant name used as `details.type` in error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Api { .. } => "ApiError",
            Self::Unauthorized(_) => "Unauthorized",
            Self::NotFound(_) => "NotFound",
            Self::NotReady(_) => "NotReady",
            Self::Timeout(_) => "Timeout",
            Self::Network(_) => "NetworkError",
            Self::Structured(_) => "StructuredError",
        }
    }

    /// Map this error onto the structured payload placed into results.
    pub fn to_payload(&self) -> ErrorPayload {
        let payload = match self {
            Self::Structured(payload) => return payload.clone(),
            Self::Unauthorized(msg) => ErrorPayload::new(ErrorCode::UNAUTHORIZED, msg.clone()),
            Self::NotFound(msg) => ErrorPayload::new(ErrorCode::NOT_FOUND, msg.clone()),
            Self::Api { status_code, .. } => ErrorPayload::new(ErrorCode::INTERNAL, self.to_string())
                .with_detail("status_code", serde_json::json!(status_code)),
            _ => ErrorPayload::new(ErrorCode::INTERNAL, self.to_string()),
        };
        payload.with_detail("type", serde_json::json!(self.kind()))
    }
}

/// Errors produced while executing a tool inside the in-process registry.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Operation declined by user: {0}")]
    Declined(String),
}

impl ToolError {
    pub fn to_payload(&self) -> ErrorPayload {
        let code = match self {
            Self::NotFound(_) => ErrorCode::NOT_FOUND,
            Self::ExecutionFailed { .. } => ErrorCode::INTERNAL,
            Self::InvalidArguments(_) => ErrorCode::VALIDATION_ERROR,
            Self::Declined(_) => ErrorCode::CANCELLED_BY_USER,
        };
        ErrorPayload::new(code, self.to_string())
    }
}

/// Violations of the append-only conversation invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("tool result {0} does not answer a call of the open assistant turn")]
    UnknownToolCall(String),

    #[error("tool call {0} was already answered")]
    DuplicateToolResult(String),

    #[error("previous tool batch is still open ({0} unanswered call(s))")]
    UnresolvedBatch(usize),

    #[error("expected a {expected} message, got {actual}")]
    WrongRole {
        expected: &'static str,
        actual: String,
    },
}

/// The run was cancelled through its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct OperationCancelled;
