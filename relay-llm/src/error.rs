use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

pub const ABORTED_CODE: &str = "aborted";
pub const ABORTED_MESSAGE: &str = "Request aborted";
const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error occurred";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("provider returned status {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),

    #[error("request aborted")]
    Aborted,
}

impl LlmError {
    /// Canonical `{message, code}` for this error.
    pub fn descriptor(&self) -> ErrorDescriptor {
        match self {
            Self::Status {
                status,
                code,
                message,
            } => ErrorDescriptor::classify(message.clone(), code.as_deref(), Some(*status)),
            Self::Aborted => ErrorDescriptor::aborted(),
            other => ErrorDescriptor::classify(other.to_string(), None, None),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                code: None,
                message: e.to_string(),
            },
            None => Self::Http(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

/// Error payload carried by `RUN_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorDescriptor {
    pub fn new(message: impl Into<String>, code: Option<String>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// Builds a descriptor whose code comes from the canonical taxonomy.
    pub fn classify(message: impl Into<String>, code: Option<&str>, status: Option<u16>) -> Self {
        let message = message.into();
        Self {
            message: if message.trim().is_empty() {
                UNKNOWN_ERROR_MESSAGE.to_string()
            } else {
                message
            },
            code: Some(map_error_code(code, status)),
        }
    }

    pub fn aborted() -> Self {
        Self {
            message: ABORTED_MESSAGE.to_string(),
            code: Some(ABORTED_CODE.to_string()),
        }
    }

    /// A stream that completed with a non-success terminal status.
    ///
    /// The declared reason becomes the code verbatim and any attached error
    /// messages are joined into the message.
    pub fn result_failure(reason: &str, errors: &[String]) -> Self {
        let joined = errors
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            message: if joined.is_empty() {
                UNKNOWN_ERROR_MESSAGE.to_string()
            } else {
                joined
            },
            code: Some(reason.to_string()),
        }
    }
}

/// Maps a provider error code and/or HTTP status onto the canonical taxonomy.
///
/// A provider code takes precedence over the status. Unknown codes are echoed,
/// unknown statuses become `http_<status>`, and `unknown_error` is used when
/// neither is available.
pub fn map_error_code(code: Option<&str>, status: Option<u16>) -> String {
    if let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) {
        return match code {
            "authentication_error" | "invalid_api_key" => "auth_error".to_string(),
            "rate_limit_error" => "rate_limit".to_string(),
            "context_length_exceeded" => "context_window_exceeded".to_string(),
            other => other.to_string(),
        };
    }

    match status {
        Some(401) => "auth_error".to_string(),
        Some(429) => "rate_limit".to_string(),
        Some(413) => "context_window_exceeded".to_string(),
        Some(other) => format!("http_{other}"),
        None => "unknown_error".to_string(),
    }
}

/// Extracts `(code, message)` from a provider error body.
///
/// Understands the common `{"error": {"type"|"code", "message"}}` envelope and
/// `{"error": "text"}`. Numeric codes are left to the HTTP status.
pub fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        let trimmed = body.trim();
        return (None, (!trimmed.is_empty()).then(|| trimmed.to_string()));
    };
    let error = value.get("error").unwrap_or(&value);
    if let Some(text) = error.as_str() {
        return (None, Some(text.to_string()));
    }

    let code = ["code", "type"].iter().find_map(|key| {
        error.get(*key).and_then(|v| match v {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
    });
    let message = error
        .get("message")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert_eq!(map_error_code(None, Some(429)), "rate_limit");
        assert_eq!(map_error_code(None, Some(401)), "auth_error");
        assert_eq!(map_error_code(None, Some(413)), "context_window_exceeded");
        assert_eq!(map_error_code(None, Some(503)), "http_503");
        assert_eq!(map_error_code(None, None), "unknown_error");
    }

    #[test]
    fn provider_codes_take_precedence_over_status() {
        assert_eq!(
            map_error_code(Some("authentication_error"), Some(400)),
            "auth_error"
        );
        assert_eq!(map_error_code(Some("invalid_api_key"), None), "auth_error");
        assert_eq!(map_error_code(Some("rate_limit_error"), None), "rate_limit");
        assert_eq!(
            map_error_code(Some("context_length_exceeded"), Some(400)),
            "context_window_exceeded"
        );
        assert_eq!(
            map_error_code(Some("overloaded_error"), Some(529)),
            "overloaded_error"
        );
        assert_eq!(map_error_code(Some("  "), Some(429)), "rate_limit");
    }

    #[test]
    fn result_failure_joins_errors() {
        let d = ErrorDescriptor::result_failure(
            "error_max_turns",
            &["first".to_string(), "second".to_string()],
        );
        assert_eq!(d.code.as_deref(), Some("error_max_turns"));
        assert_eq!(d.message, "first, second");

        let empty = ErrorDescriptor::result_failure("error_during_execution", &[]);
        assert_eq!(empty.message, "Unknown error occurred");
    }

    #[test]
    fn status_error_descriptor_uses_parsed_code() {
        let err = LlmError::Status {
            status: 400,
            code: Some("context_length_exceeded".to_string()),
            message: "too long".to_string(),
        };
        let d = err.descriptor();
        assert_eq!(d.code.as_deref(), Some("context_window_exceeded"));
        assert_eq!(d.message, "too long");

        let d = LlmError::Http("connection reset".to_string()).descriptor();
        assert_eq!(d.code.as_deref(), Some("unknown_error"));
        assert_eq!(LlmError::Aborted.descriptor(), ErrorDescriptor::aborted());
    }

    #[test]
    fn parse_error_body_handles_common_envelopes() {
        let (code, message) = parse_error_body(
            r#"{"error":{"message":"bad key","type":"invalid_request_error","code":"invalid_api_key"}}"#,
        );
        assert_eq!(code.as_deref(), Some("invalid_api_key"));
        assert_eq!(message.as_deref(), Some("bad key"));

        let (code, message) = parse_error_body(
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#,
        );
        assert_eq!(code.as_deref(), Some("rate_limit_error"));
        assert_eq!(message.as_deref(), Some("slow down"));

        let (code, message) = parse_error_body(r#"{"error":"model not found"}"#);
        assert_eq!(code, None);
        assert_eq!(message.as_deref(), Some("model not found"));

        let (code, message) = parse_error_body("upstream exploded");
        assert_eq!(code, None);
        assert_eq!(message.as_deref(), Some("upstream exploded"));
    }
}
