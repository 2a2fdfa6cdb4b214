// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store key for the access token
pub const ACCESS_TOKEN_KEY: &str = "token";

/// Store key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Store key for the access token expiry (epoch milliseconds, decimal string)
pub const ACCESS_TOKEN_EXPIRY_KEY: &str = "tokenExpiration";

/// Persisted authentication state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,

    /// Instant after which the access token is treated as invalid by the client.
    /// `None` only when read back from a store holding no (or a corrupt) expiry.
    pub access_token_expiry: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        access_token_expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            access_token_expiry: Some(access_token_expiry),
        }
    }
}

/// Lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Process started, nothing reconciled yet
    Uninitialized,

    /// First reconciliation against the credential store is running
    Initializing,

    SignedIn,
    SignedOut,
}

/// Read-mostly view of the session handed to UI collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
}

impl SessionState {
    /// True iff a credential record is currently believed valid
    pub fn is_signed_in(&self) -> bool {
        self.phase == SessionPhase::SignedIn
    }

    /// True until the first reconciliation completes
    pub fn is_initializing(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Uninitialized | SessionPhase::Initializing
        )
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Uninitialized,
        }
    }
}

/// Refresh endpoint request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Refresh endpoint response body.
/// Deployments have answered with both `newToken`/`newRefreshToken` and
/// `token`/`refreshToken`.
#[derive(Deserialize)]
pub struct RefreshResponse {
    #[serde(rename = "newToken", alias = "token")]
    pub access_token: String,

    #[serde(rename = "newRefreshToken", alias = "refreshToken", default)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_response_new_field_names() {
        let data: RefreshResponse =
            serde_json::from_str(r#"{"newToken":"T2","newRefreshToken":"R2"}"#).unwrap();
        assert_eq!(data.access_token, "T2");
        assert_eq!(data.refresh_token.as_deref(), Some("R2"));
    }

    #[test]
    fn test_refresh_response_plain_field_names() {
        let data: RefreshResponse =
            serde_json::from_str(r#"{"token":"T2","refreshToken":"R2"}"#).unwrap();
        assert_eq!(data.access_token, "T2");
        assert_eq!(data.refresh_token.as_deref(), Some("R2"));
    }

    #[test]
    fn test_refresh_response_without_refresh_token() {
        let data: RefreshResponse = serde_json::from_str(r#"{"newToken":"T2"}"#).unwrap();
        assert_eq!(data.access_token, "T2");
        assert!(data.refresh_token.is_none());
    }

    #[test]
    fn test_refresh_response_missing_token_is_error() {
        assert!(serde_json::from_str::<RefreshResponse>(r#"{"message":"ok"}"#).is_err());
    }

    #[test]
    fn test_refresh_request_body() {
        let body = serde_json::to_value(RefreshRequest {
            refresh_token: "R1".to_string(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "refreshToken": "R1" }));
    }

    #[test]
    fn test_session_state_flags() {
        let state = SessionState::default();
        assert!(state.is_initializing());
        assert!(!state.is_signed_in());

        let state = SessionState {
            phase: SessionPhase::Initializing,
        };
        assert!(state.is_initializing());

        let state = SessionState {
            phase: SessionPhase::SignedIn,
        };
        assert!(!state.is_initializing());
        assert!(state.is_signed_in());

        let state = SessionState {
            phase: SessionPhase::SignedOut,
        };
        assert!(!state.is_initializing());
        assert!(!state.is_signed_in());
    }
}
