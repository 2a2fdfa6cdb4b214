// Error handling module
// Defines the typed failures of the credential store, refresh and fetch paths

use thiserror::Error;

/// Credential store read or write failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Credential storage error: {0}")]
pub struct StorageError(pub String);

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError(err.to_string())
    }
}

/// Failures of the token refresh operation
///
/// `Clone` because a single in-flight refresh result is handed to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// Nothing to refresh with; no network call was made
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Network failure, non-2xx response or malformed response body
    #[error("Token refresh failed: {0}")]
    Failed(String),

    /// Credential store fault while reading or writing the record
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures of an explicit sign-in
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignInError {
    /// A credential record needs both tokens; nothing was written
    #[error("Sign-in requires a non-empty access token and refresh token")]
    EmptyToken,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures of an authenticated fetch
#[derive(Error, Debug)]
pub enum FetchError {
    /// The server rejected the token and the refresh could not recover it.
    /// The session has been signed out.
    #[error("Not authenticated - please sign in again")]
    Unauthenticated,

    /// Network error unrelated to auth (DNS, timeout, connection reset)
    #[error("Transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// Credential store fault
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Streaming bodies cannot be replayed after a refresh
    #[error("Request body is not cloneable")]
    RequestNotCloneable,
}

/// Errors returned by the marketplace endpoint helpers
#[derive(Error, Debug)]
pub enum ApiError {
    /// Failure inside the authenticated request wrapper
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Non-2xx response from the backend
    #[error("Backend error: {status} - {message}")]
    Backend { status: u16, message: String },

    /// Request rejected before it was sent
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Response body did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Credential store fault
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<SignInError> for ApiError {
    fn from(err: SignInError) -> Self {
        match err {
            SignInError::EmptyToken => ApiError::InvalidResponse(err.to_string()),
            SignInError::Storage(e) => ApiError::Storage(e),
        }
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Build a backend error from a status and raw body.
    /// Uses the body's `message` field when it is JSON, the truncated text otherwise.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| truncate_body(body));

        ApiError::Backend { status, message }
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }

    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

/// Result type alias for marketplace API operations
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = StorageError("disk full".to_string());
        assert_eq!(err.to_string(), "Credential storage error: disk full");

        let err = RefreshError::Failed("500 Internal Server Error".to_string());
        assert_eq!(
            err.to_string(),
            "Token refresh failed: 500 Internal Server Error"
        );

        let err = ApiError::Backend {
            status: 429,
            message: "Rate limit exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "Backend error: 429 - Rate limit exceeded");
    }

    #[test]
    fn test_storage_error_is_transparent_in_refresh_error() {
        let err = RefreshError::from(StorageError("locked".to_string()));
        assert_eq!(err.to_string(), "Credential storage error: locked");
    }

    #[test]
    fn test_unauthenticated_message() {
        assert_eq!(
            FetchError::Unauthenticated.to_string(),
            "Not authenticated - please sign in again"
        );
    }

    #[test]
    fn test_from_status_uses_json_message() {
        let err = ApiError::from_status(400, r#"{"message":"Insufficient balance"}"#);
        match err {
            ApiError::Backend { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Insufficient balance");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_from_status_falls_back_to_body_text() {
        let err = ApiError::from_status(502, "Bad Gateway");
        assert_eq!(err.to_string(), "Backend error: 502 - Bad Gateway");
    }

    #[test]
    fn test_from_status_truncates_long_bodies() {
        let body = "x".repeat(MAX_ERROR_BODY_LENGTH + 100);
        match ApiError::from_status(500, &body) {
            ApiError::Backend { message, .. } => {
                assert!(message.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
                assert!(message.contains("truncated, 600 total bytes"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
