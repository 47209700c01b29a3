use serde_json::Value;
use thiserror::Error;

/// Fallback shown when a rejected login carries no server message
pub const LOGIN_FAILED_MESSAGE: &str = "Login failed";

/// Session-level failures. `Clone` so a single renewal outcome can be
/// handed to every caller attached to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    InvalidCredentials(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Rejected(String),
}

/// Errors surfaced by gated API calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Failure to complete an exchange at all (no HTTP status available).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut cut = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
}

/// Pull a human-readable message out of an error payload.
///
/// Understands `{"detail": "..."}`, validation lists
/// `{"detail": [{"msg": "..."}]}` and `{"message": "..."}`.
pub fn server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let message = match value.get("detail").or_else(|| value.get("message"))? {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("msg").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("; "),
        _ => return None,
    };
    (!message.trim().is_empty()).then_some(message)
}

impl ApiError {
    /// Map a non-success status to its typed error.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = server_message(body).unwrap_or_else(|| truncate_body(body));
        match status {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::Rejected { status, message },
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        ApiError::Network(e.to_string())
    }
}

impl From<TransportError> for AuthError {
    fn from(e: TransportError) -> Self {
        AuthError::NetworkError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_detail_string() {
        assert_eq!(
            server_message(r#"{"detail":"Incorrect username or password"}"#),
            Some("Incorrect username or password".to_string())
        );
    }

    #[test]
    fn test_server_message_validation_list() {
        let body = r#"{"detail":[{"loc":["body","email"],"msg":"field required"},{"msg":"too short"}]}"#;
        assert_eq!(server_message(body), Some("field required; too short".to_string()));
    }

    #[test]
    fn test_server_message_absent() {
        assert_eq!(server_message("<html>bad gateway</html>"), None);
        assert_eq!(server_message(r#"{"detail":""}"#), None);
        assert_eq!(server_message(r#"{"other":1}"#), None);
    }

    #[test]
    fn test_from_status_mapping() {
        assert_eq!(
            ApiError::from_status(403, r#"{"detail":"admins only"}"#),
            ApiError::Forbidden("admins only".to_string())
        );
        assert_eq!(ApiError::from_status(429, ""), ApiError::RateLimited);
        assert!(matches!(ApiError::from_status(503, "down"), ApiError::ServerError(_)));
        assert_eq!(
            ApiError::from_status(422, r#"{"detail":"bad plan"}"#),
            ApiError::Rejected {
                status: 422,
                message: "bad plan".to_string()
            }
        );
    }

    #[test]
    fn test_truncate_body_long() {
        let body = "x".repeat(600);
        let truncated = truncate_body(&body);
        assert!(truncated.starts_with(&"x".repeat(500)));
        assert!(truncated.contains("600 total bytes"));
    }
}
