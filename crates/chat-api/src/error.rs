//! Typed outcome of a dispatched request
//!
//! Every failure the dispatcher can observe lands in exactly one variant, so
//! callers can branch on it without inspecting status codes:
//! - `AuthExpired` means "send the user back to login"
//! - `Network` and 5xx/429 `Server` errors are worth offering a retry
//! - everything else is a definitive answer from the backend

use reqwest::StatusCode;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No response reached us (connect failure, timeout, dropped body)
    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// The session could not be renewed and has been cleared
    #[error("session expired, log in again")]
    AuthExpired,

    /// 2xx response whose body is not the expected JSON
    #[error("could not parse response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::AuthExpired)
    }

    /// Whether repeating the same call later could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Server { status, .. } => *status >= 500 || *status == 429,
            ApiError::AuthExpired | ApiError::Parse(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Network(_) => "network_error",
            ApiError::Server { .. } => "server_error",
            ApiError::AuthExpired => "auth_expired",
            ApiError::Parse(_) => "parse_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Build a `Server` error from a non-2xx response body.
pub(crate) fn server_error(status: StatusCode, body: &[u8]) -> ApiError {
    ApiError::Server {
        status: status.as_u16(),
        message: server_message(status, body),
    }
}

/// Pick the human-readable message out of an error body.
///
/// JSON bodies are searched for `detail`, `message`, `error.message` and
/// `error`, in that order. A body that is not JSON is used as-is. Falls back to
/// the canonical reason phrase.
fn server_message(status: StatusCode, body: &[u8]) -> String {
    let fallback = || {
        status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string()
    };

    match serde_json::from_slice::<Value>(body) {
        Ok(value) => message_from_json(&value).unwrap_or_else(fallback),
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            if text.is_empty() {
                fallback()
            } else {
                text.to_string()
            }
        }
    }
}

fn message_from_json(value: &Value) -> Option<String> {
    if let Some(detail) = value.get("detail") {
        match detail {
            Value::String(s) => return Some(s.clone()),
            // Validation errors come back as a list of {loc, msg, type}
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("; ");
                if !joined.is_empty() {
                    return Some(joined);
                }
            }
            _ => {}
        }
    }
    if let Some(message) = value.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    match value.get("error") {
        Some(Value::Object(error)) => error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        Some(Value::String(error)) => Some(error.clone()),
        _ => None,
    }
}
