// Token refresh logic
// One network exchange per refresh; concurrent callers share the in-flight result

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Url};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::credentials::{read_record, write_record, CredentialStore};
use super::expiry::expiry_after;
use super::types::{
    CredentialRecord, RefreshRequest, RefreshResponse, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
use crate::error::RefreshError;

pub type RefreshResult = Result<CredentialRecord, RefreshError>;

type PendingRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Where and how to refresh
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    pub client: Client,
    pub url: Url,
    pub token_lifetime: Duration,
}

/// Exchange the stored refresh token for a new credential record.
///
/// Failures never remove the stored credentials; the caller decides whether
/// to sign out.
pub async fn refresh_credentials(
    endpoint: &RefreshEndpoint,
    store: &dyn CredentialStore,
) -> RefreshResult {
    let refresh_token = match store.get(REFRESH_TOKEN_KEY).await? {
        Some(token) if !token.is_empty() => token,
        _ => {
            tracing::debug!("No refresh token stored, skipping refresh");
            return Err(RefreshError::NoRefreshToken);
        }
    };
    let access_token = store.get(ACCESS_TOKEN_KEY).await?;

    tracing::info!(url = %endpoint.url, "Refreshing access token...");

    let mut request = endpoint
        .client
        .post(endpoint.url.clone())
        .json(&RefreshRequest {
            refresh_token: refresh_token.clone(),
        });
    if let Some(token) = access_token.as_deref().filter(|t| !t.is_empty()) {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| {
        tracing::warn!(error = %e, "Failed to send refresh request");
        RefreshError::Failed(format!("Failed to send refresh request: {}", e))
    })?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            body = %error_text,
            "Token refresh rejected"
        );
        return Err(RefreshError::Failed(format!("{} - {}", status, error_text)));
    }

    let data: RefreshResponse = response.json().await.map_err(|e| {
        RefreshError::Failed(format!("Failed to parse refresh response: {}", e))
    })?;

    if data.access_token.is_empty() {
        return Err(RefreshError::Failed(
            "Refresh response does not contain a token".to_string(),
        ));
    }

    // Backends that do not rotate refresh tokens omit the new one
    let refresh_token = data
        .refresh_token
        .filter(|t| !t.is_empty())
        .unwrap_or(refresh_token);

    let expires_at = expiry_after(Utc::now(), endpoint.token_lifetime);
    let record = CredentialRecord::new(data.access_token, refresh_token, expires_at);
    write_record(store, &record).await?;

    tracing::info!("Token refreshed, expires: {}", expires_at.to_rfc3339());

    Ok(record)
}

#[derive(Default)]
struct InFlight {
    generation: u64,
    pending: Option<(u64, PendingRefresh)>,
}

/// Token refresher with concurrency control
///
/// At most one refresh runs at a time. Callers arriving while one is in
/// flight await its result instead of issuing their own request, so a backend
/// that invalidates refresh tokens on first use never sees a second exchange.
///
/// The exchange runs on its own task and retires the in-flight slot when it
/// finishes, so a completed result is never handed to a later caller even if
/// every waiter was cancelled.
pub struct TokenRefresher {
    endpoint: RefreshEndpoint,
    store: Arc<dyn CredentialStore>,
    in_flight: Arc<Mutex<InFlight>>,
}

impl TokenRefresher {
    pub fn new(endpoint: RefreshEndpoint, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            endpoint,
            store,
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    /// Refresh, joining any refresh already in flight
    pub async fn refresh(&self) -> RefreshResult {
        self.refresh_after_rejection(None).await
    }

    /// Refresh because the server rejected `rejected`.
    ///
    /// If the stored access token no longer matches `rejected`, a concurrent
    /// refresh has already completed and its record is returned without
    /// another network call.
    pub async fn refresh_after_rejection(&self, rejected: Option<&str>) -> RefreshResult {
        let pending = {
            let mut in_flight = self.in_flight.lock().await;

            match in_flight.pending.clone() {
                Some((generation, pending)) => {
                    tracing::debug!(generation, "Joining in-flight token refresh");
                    pending
                }
                None => {
                    if let Some(rejected) = rejected {
                        if let Some(record) = read_record(self.store.as_ref()).await? {
                            if record.access_token != rejected {
                                tracing::debug!("Access token already replaced, reusing it");
                                return Ok(record);
                            }
                        }
                    }

                    in_flight.generation += 1;
                    let generation = in_flight.generation;
                    let pending = self.start(generation);

                    in_flight.pending = Some((generation, pending.clone()));
                    pending
                }
            }
        };

        pending.await
    }

    fn start(&self, generation: u64) -> PendingRefresh {
        let endpoint = self.endpoint.clone();
        let store = Arc::clone(&self.store);
        let slot = Arc::clone(&self.in_flight);

        let task = tokio::spawn(async move {
            let result = refresh_credentials(&endpoint, store.as_ref()).await;

            // Retire the slot before anyone can observe the result; a newer refresh is left alone
            let mut in_flight = slot.lock().await;
            if matches!(&in_flight.pending, Some((g, _)) if *g == generation) {
                in_flight.pending = None;
            }

            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Token refresh task failed");
                Err(RefreshError::Failed(format!("Refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    /// Drop any in-flight refresh. The exchange itself still runs to completion.
    pub async fn abandon(&self) {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.pending.take().is_some() {
            tracing::debug!("Abandoned in-flight token refresh");
        }
    }

    #[cfg(test)]
    async fn has_pending(&self) -> bool {
        self.in_flight.lock().await.pending.is_some()
    }
}
