//! Error taxonomy and classification of failed responses.

use serde_json::Value;
use std::fmt;

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

/// Fatal failures of a chat call.
///
/// Hallucinated tool calls are not errors of this type; see [`Hallucination`].
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Model still requested tools after {limit} iterations")]
    IterationLimitExceeded { limit: u32 },

    #[error("No executor registered for declared tool: {0}")]
    MissingExecutor(String),

    #[error("Failed to encode request: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ChatError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ChatError::Protocol(message.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ChatError::Transport(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, ChatError::Protocol(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Streaming cancelled by caller")]
    Cancelled,

    #[error("Stream closed before the response was complete")]
    Truncated,
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        TransportError::Network(error.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(error: reqwest::Error) -> Self {
        ChatError::Transport(error.into())
    }
}

/// Category of an application error, derived from its `type` field or the
/// HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorKind {
    InvalidRequest,
    Authentication,
    PermissionDenied,
    NotFound,
    RateLimit,
    Server,
    Overloaded,
    Other(String),
}

impl ApiErrorKind {
    fn classify(error_type: Option<&str>, status: Option<u16>) -> Self {
        match error_type {
            Some("invalid_request_error") => return ApiErrorKind::InvalidRequest,
            Some("authentication_error") => return ApiErrorKind::Authentication,
            Some("permission_error") => return ApiErrorKind::PermissionDenied,
            Some("not_found_error") => return ApiErrorKind::NotFound,
            Some("rate_limit_error") | Some("insufficient_quota") => {
                return ApiErrorKind::RateLimit
            }
            Some("server_error") | Some("api_error") => return ApiErrorKind::Server,
            Some("overloaded_error") => return ApiErrorKind::Overloaded,
            _ => {}
        }

        match status {
            Some(400) => ApiErrorKind::InvalidRequest,
            Some(401) => ApiErrorKind::Authentication,
            Some(403) => ApiErrorKind::PermissionDenied,
            Some(404) => ApiErrorKind::NotFound,
            Some(429) => ApiErrorKind::RateLimit,
            Some(503) | Some(529) => ApiErrorKind::Overloaded,
            Some(status) if status >= 500 => ApiErrorKind::Server,
            _ => ApiErrorKind::Other(error_type.unwrap_or("unknown").to_string()),
        }
    }
}

/// Structured `{"error": {...}}` body returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub message: String,
    pub error_type: Option<String>,
    pub param: Option<Value>,
    pub code: Option<String>,
    /// HTTP status of the response carrying the error, when known.
    pub status: Option<u16>,
}

impl ApiError {
    pub fn kind(&self) -> ApiErrorKind {
        ApiErrorKind::classify(self.error_type.as_deref(), self.status)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(error_type) = &self.error_type {
            write!(f, " (type: {error_type})")?;
        }
        if let Some(code) = &self.code {
            write!(f, " (code: {code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

/// Inspects a parsed JSON payload for an application error.
///
/// Returns `None` when there is no `error` member. An `error` member that is
/// not an object with a string `message` is reported as a protocol error
/// rather than guessing a message.
pub fn extract_api_error(value: &Value, status: Option<u16>) -> Option<ChatError> {
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }

    let Some(object) = error.as_object() else {
        return Some(ChatError::protocol(format!(
            "Malformed error body, expected an object: {error}"
        )));
    };
    let Some(message) = object.get("message").and_then(Value::as_str) else {
        return Some(ChatError::protocol(format!(
            "Malformed error body, missing message: {error}"
        )));
    };

    let optional_string = |key: &str| {
        object.get(key).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    Some(ChatError::Api(ApiError {
        message: message.to_string(),
        error_type: optional_string("type"),
        param: object.get("param").filter(|v| !v.is_null()).cloned(),
        code: optional_string("code"),
        status,
    }))
}

/// Classifies the body of a non-2xx response.
///
/// A parseable `{"error": {...}}` body becomes an application error,
/// anything else stays a transport error carrying the raw body.
pub fn classify_error_response(status: u16, body: &str) -> ChatError {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => extract_api_error(&value, Some(status)).unwrap_or_else(|| {
            ChatError::Transport(TransportError::Http {
                status,
                body: body.to_string(),
            })
        }),
        Err(_) => ChatError::Transport(TransportError::Http {
            status,
            body: body.to_string(),
        }),
    }
}

/// A structurally invalid tool call produced by the model.
///
/// This is recoverable: the reason is sent back to the model as the tool's
/// result so it can correct itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct Hallucination {
    pub reason: String,
}

impl Hallucination {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// JSON payload for the tool-role reply describing the mistake.
    pub fn to_tool_content(&self) -> String {
        error_payload(&self.reason)
    }
}

/// `{"error":{"message":...}}`, the shape used for every failed tool reply.
pub(crate) fn error_payload(message: &str) -> String {
    serde_json::json!({ "error": { "message": message } }).to_string()
}
