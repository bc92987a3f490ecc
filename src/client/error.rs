//! Session client error taxonomy.
//!
//! Transport failures are recovered by the supervisor, never by the client
//! itself; protocol errors are surfaced verbatim to the caller and are never
//! fatal to the session.

use serde_json::Value;
use thiserror::Error;

/// Failure kinds observable by callers of the session client.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
    /// Dial, handshake, read, or write failure on the WebSocket.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response payload carried an `error` field.
    #[error("{code}: {message}")]
    Protocol {
        code: String,
        message: String,
        title: String,
    },

    /// The request exceeded its configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Local input check failed; nothing was sent.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The session is down (including during reconnect).
    #[error("not connected")]
    NotConnected,

    /// Operation invalid for the current state.
    #[error("invalid state: {0}")]
    State(String),
}

impl ClientError {
    pub fn protocol(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            code: code.into(),
            message: message.into(),
            title: String::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }
}

/// Extract a protocol error from a response payload, if it carries one.
///
/// Server errors are flagged by a non-empty string `error` field; `message`
/// and `title` are optional elaborations.
pub fn response_error(payload: &Value) -> Option<ClientError> {
    let code = payload.get("error")?.as_str()?;
    if code.is_empty() {
        return None;
    }
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let title = payload
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(ClientError::Protocol {
        code: code.to_string(),
        message: message.to_string(),
        title: title.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_error_absent() {
        assert!(response_error(&json!({"ok": true})).is_none());
        assert!(response_error(&json!({"error": ""})).is_none());
        assert!(response_error(&Value::Null).is_none());
    }

    #[test]
    fn test_response_error_extracted() {
        let err = response_error(&json!({
            "error": "verify.code.wrong",
            "message": "Wrong code",
            "title": "Auth"
        }))
        .unwrap();
        match err {
            ClientError::Protocol { code, message, title } => {
                assert_eq!(code, "verify.code.wrong");
                assert_eq!(message, "Wrong code");
                assert_eq!(title, "Auth");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_display_is_compact() {
        let err = ClientError::protocol("busy", "try later");
        assert_eq!(err.to_string(), "busy: try later");
    }
}
