use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use std::sync::Arc;
use tokio::sync::watch;

use super::credentials::{clear_record, read_record, write_record, CredentialStore, SqliteCredentialStore};
use super::expiry::is_expired_with_leeway;
use super::refresh::{RefreshEndpoint, RefreshResult, TokenRefresher};
use super::types::{CredentialRecord, SessionPhase, SessionState, ACCESS_TOKEN_KEY};
use crate::config::Config;
use crate::error::{RefreshError, SignInError, StorageError};
use crate::http_client::build_http_client;

/// Session context
///
/// Owns the signed-in state and is the only writer of the credential record.
/// Shared by handle (`Arc<Session>`) with every collaborator that needs auth.
pub struct Session {
    /// Durable credential storage
    store: Arc<dyn CredentialStore>,

    /// Coalescing refresher over the same store
    refresher: TokenRefresher,

    /// Current state, observable by UI collaborators
    state: watch::Sender<SessionState>,

    /// How long a freshly issued access token is trusted
    token_lifetime: Duration,

    /// Treat tokens as expired this long before their stored expiry
    expiry_leeway: Duration,
}

impl Session {
    /// Create a session over an explicit store and HTTP client
    pub fn new(config: &Config, client: Client, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let url = Url::parse(&config.api_base_url)
            .and_then(|base| base.join(&config.refresh_path))
            .with_context(|| {
                format!(
                    "Invalid refresh endpoint: {}{}",
                    config.api_base_url, config.refresh_path
                )
            })?;

        let endpoint = RefreshEndpoint {
            client,
            url,
            token_lifetime: config.token_lifetime(),
        };

        let (state, _) = watch::channel(SessionState::default());

        Ok(Self {
            refresher: TokenRefresher::new(endpoint, Arc::clone(&store)),
            store,
            state,
            token_lifetime: config.token_lifetime(),
            expiry_leeway: config.expiry_leeway(),
        })
    }

    /// Create a session backed by the SQLite credential database from config
    pub fn open(config: &Config) -> Result<Self> {
        tracing::info!(
            "Loading credentials from SQLite: {}",
            config.credential_db_file.display()
        );
        let store = SqliteCredentialStore::open(
            &config.credential_db_file,
            config.credential_scope.clone(),
        )
        .context("Failed to open credential database")?;

        let client = build_http_client(config)?;
        Self::new(config, client, Arc::new(store))
    }

    /// Current state snapshot
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_signed_in(&self) -> bool {
        self.state().is_signed_in()
    }

    pub fn is_initializing(&self) -> bool {
        self.state().is_initializing()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Lifetime applied to tokens issued by sign-in and refresh
    pub fn token_lifetime(&self) -> Duration {
        self.token_lifetime
    }

    /// Stored access token, if any
    pub async fn access_token(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .store
            .get(ACCESS_TOKEN_KEY)
            .await?
            .filter(|t| !t.is_empty()))
    }

    /// Stored credential record, if complete
    pub async fn credentials(&self) -> Result<Option<CredentialRecord>, StorageError> {
        read_record(self.store.as_ref()).await
    }

    /// Run the first reconciliation against the credential store
    pub async fn init(&self) -> Result<SessionState, StorageError> {
        self.check_auth_status().await
    }

    /// Abandon any in-flight refresh and forget the in-memory state.
    /// Persisted credentials are kept for the next `init`.
    pub async fn dispose(&self) {
        self.refresher.abandon().await;
        self.set_phase(SessionPhase::Uninitialized);
        tracing::debug!("Session disposed");
    }

    /// Persist a full credential record and mark the session signed in.
    /// Empty tokens are rejected before anything is written.
    pub async fn sign_in(
        &self,
        access_token: &str,
        refresh_token: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), SignInError> {
        if access_token.is_empty() || refresh_token.is_empty() {
            tracing::warn!("Rejecting sign-in with an empty token");
            return Err(SignInError::EmptyToken);
        }

        let record = CredentialRecord::new(access_token, refresh_token, expiry);
        write_record(self.store.as_ref(), &record).await?;

        tracing::info!("Signed in, token expires: {}", expiry.to_rfc3339());
        self.set_phase(SessionPhase::SignedIn);
        Ok(())
    }

    /// Remove the credential record and mark the session signed out.
    /// Safe to call when already signed out.
    pub async fn sign_out(&self) -> Result<(), StorageError> {
        clear_record(self.store.as_ref()).await?;

        tracing::info!("Signed out");
        self.set_phase(SessionPhase::SignedOut);
        Ok(())
    }

    /// Reconcile the in-memory state with the credential store.
    ///
    /// Refreshes an expired token; a failed refresh signs the session out.
    /// Always leaves the session out of the initializing phases, even when a
    /// storage fault is returned.
    pub async fn check_auth_status(&self) -> Result<SessionState, StorageError> {
        self.state.send_if_modified(|state| {
            if state.phase == SessionPhase::Uninitialized {
                state.phase = SessionPhase::Initializing;
                true
            } else {
                false
            }
        });

        match self.reconcile().await {
            Ok(phase) => {
                self.set_phase(phase);
                Ok(self.state())
            }
            Err(e) => {
                tracing::error!("Error checking auth status: {}", e);
                if self.is_initializing() {
                    self.set_phase(SessionPhase::SignedOut);
                }
                Err(e)
            }
        }
    }

    async fn reconcile(&self) -> Result<SessionPhase, StorageError> {
        let Some(record) = read_record(self.store.as_ref()).await? else {
            tracing::debug!("No stored credentials");
            return Ok(SessionPhase::SignedOut);
        };

        if !is_expired_with_leeway(record.access_token_expiry, Utc::now(), self.expiry_leeway) {
            return Ok(SessionPhase::SignedIn);
        }

        tracing::info!("Stored access token expired, refreshing...");
        match self.refresher.refresh().await {
            Ok(_) => Ok(SessionPhase::SignedIn),
            Err(RefreshError::Storage(e)) => Err(e),
            Err(e) => {
                tracing::warn!("Token refresh failed during auth check: {}", e);
                clear_record(self.store.as_ref()).await?;
                Ok(SessionPhase::SignedOut)
            }
        }
    }

    /// Coalesced refresh after the server rejected `rejected`
    pub async fn refresh_after_rejection(&self, rejected: Option<&str>) -> RefreshResult {
        self.refresher.refresh_after_rejection(rejected).await
    }

    /// Coalesced refresh
    pub async fn refresh(&self) -> RefreshResult {
        self.refresher.refresh().await
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.state.send_if_modified(|state| {
            if state.phase == phase {
                return false;
            }
            tracing::debug!(from = ?state.phase, to = ?phase, "Session phase changed");
            state.phase = phase;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::MemoryCredentialStore;
    use crate::auth::types::{ACCESS_TOKEN_EXPIRY_KEY, REFRESH_TOKEN_KEY};

    fn session_with(store: Arc<dyn CredentialStore>, base_url: &str) -> Session {
        let config = Config {
            api_base_url: format!("{}/", base_url),
            ..Config::default()
        };
        Session::new(&config, Client::new(), store).unwrap()
    }

    fn expiry_in(minutes: i64) -> DateTime<Utc> {
        crate::auth::expiry::expiry_after(Utc::now(), Duration::minutes(minutes))
    }

    #[tokio::test]
    async fn test_starts_uninitialized() {
        let session = session_with(Arc::new(MemoryCredentialStore::new()), "http://localhost:1");
        assert_eq!(session.state().phase, SessionPhase::Uninitialized);
        assert!(session.is_initializing());
        assert!(!session.is_signed_in());
    }

    #[tokio::test]
    async fn test_empty_store_is_signed_out() {
        let session = session_with(Arc::new(MemoryCredentialStore::new()), "http://localhost:1");
        let state = session.init().await.unwrap();
        assert_eq!(state.phase, SessionPhase::SignedOut);
        assert!(!session.is_initializing());
    }

    #[tokio::test]
    async fn test_sign_in_then_sign_out() {
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(store.clone(), "http://localhost:1");

        session.sign_in("T1", "R1", expiry_in(60)).await.unwrap();
        assert!(session.is_signed_in());
        assert_eq!(store.len(), 3);

        session.sign_out().await.unwrap();
        assert!(!session.is_signed_in());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sign_in_rejects_empty_tokens() {
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(store.clone(), "http://localhost:1");

        let result = session.sign_in("", "R1", expiry_in(60)).await;
        assert_eq!(result, Err(SignInError::EmptyToken));

        let result = session.sign_in("T1", "", expiry_in(60)).await;
        assert_eq!(result, Err(SignInError::EmptyToken));

        assert!(store.is_empty());
        assert!(!session.is_signed_in());
        assert_eq!(session.state().phase, SessionPhase::Uninitialized);
    }

    #[tokio::test]
    async fn test_sign_out_is_idempotent() {
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(store.clone(), "http://localhost:1");

        session.sign_out().await.unwrap();
        session.sign_out().await.unwrap();
        assert_eq!(session.state().phase, SessionPhase::SignedOut);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_valid_token_needs_no_network() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/refresh-token")
            .expect(0)
            .create_async()
            .await;

        let session = session_with(Arc::new(MemoryCredentialStore::new()), &server.url());
        session.sign_in("T1", "R1", expiry_in(60)).await.unwrap();
        session.dispose().await;

        let state = session.check_auth_status().await.unwrap();
        assert_eq!(state.phase, SessionPhase::SignedIn);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_expiry_triggers_refresh() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/refresh-token")
            .with_status(200)
            .with_body(r#"{"newToken":"T2","newRefreshToken":"R2"}"#)
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(MemoryCredentialStore::new());
        store.set(REFRESH_TOKEN_KEY, "R1").await.unwrap();
        store.set(ACCESS_TOKEN_KEY, "T1").await.unwrap();

        let session = session_with(store.clone(), &server.url());
        let state = session.init().await.unwrap();

        assert!(state.is_signed_in());
        assert!(store.get(ACCESS_TOKEN_EXPIRY_KEY).await.unwrap().is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_leeway_refreshes_early() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/refresh-token")
            .with_status(200)
            .with_body(r#"{"newToken":"T2"}"#)
            .expect(1)
            .create_async()
            .await;

        let config = Config {
            api_base_url: format!("{}/", server.url()),
            expiry_leeway_secs: 600,
            ..Config::default()
        };
        let session =
            Session::new(&config, Client::new(), Arc::new(MemoryCredentialStore::new())).unwrap();

        // Expires in 5 minutes, inside the 10 minute leeway
        session.sign_in("T1", "R1", expiry_in(5)).await.unwrap();
        session.check_auth_status().await.unwrap();

        assert_eq!(session.access_token().await.unwrap().as_deref(), Some("T2"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let session = session_with(Arc::new(MemoryCredentialStore::new()), "http://localhost:1");
        let mut rx = session.subscribe();

        session.sign_in("T1", "R1", expiry_in(60)).await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_signed_in());

        session.sign_out().await.unwrap();
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_signed_in());
    }

    #[tokio::test]
    async fn test_dispose_resets_phase_but_keeps_credentials() {
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(store.clone(), "http://localhost:1");

        session.sign_in("T1", "R1", expiry_in(60)).await.unwrap();
        session.dispose().await;

        assert_eq!(session.state().phase, SessionPhase::Uninitialized);
        assert!(session.credentials().await.unwrap().is_some());
    }

    #[test]
    fn test_invalid_refresh_endpoint() {
        let config = Config {
            api_base_url: "::not a url::".to_string(),
            ..Config::default()
        };
        let result = Session::new(&config, Client::new(), Arc::new(MemoryCredentialStore::new()));
        assert!(result.is_err());
    }
}
