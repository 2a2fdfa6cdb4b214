use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, IntoUrl, Method, Request, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Session;
use crate::config::Config;
use crate::error::{FetchError, RefreshError};

/// Build the shared reqwest client with configured timeouts
pub fn build_http_client(config: &Config) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.http_connect_timeout))
        .timeout(Duration::from_secs(config.http_request_timeout))
        .build()
        .context("Failed to create HTTP client")
}

/// HTTP client that attaches the session's bearer token
///
/// On 401 it refreshes the token once (coalesced with any concurrent
/// refresh) and retries the request once. A failed refresh signs the
/// session out.
#[derive(Clone)]
pub struct AuthenticatedClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session providing and refreshing credentials
    session: Arc<Session>,
}

impl AuthenticatedClient {
    /// Create a new client with its own connection pool
    pub fn new(session: Arc<Session>, config: &Config) -> Result<Self> {
        Ok(Self::with_client(session, build_http_client(config)?))
    }

    /// Create a client over an existing reqwest client
    pub fn with_client(session: Arc<Session>, client: Client) -> Self {
        Self { client, session }
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get the session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Start building a request on the underlying client
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Build and send a request through [`Self::authenticated_fetch`]
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, FetchError> {
        let request = builder.build()?;
        self.authenticated_fetch(request).await
    }

    /// Like [`Self::send`], but the request is rebuilt from `build` for the
    /// retry instead of cloned. Use this for bodies that cannot be replayed,
    /// such as multipart uploads.
    pub async fn send_with<F>(&self, build: F) -> Result<Response, FetchError>
    where
        F: Fn() -> Result<RequestBuilder, FetchError>,
    {
        let request = build()?.build()?;
        self.fetch_with_retry(request, || Ok(build()?.build()?)).await
    }

    /// Execute a request with the session's bearer token.
    ///
    /// - 401: refresh once and retry once; the retry's response is final
    /// - refresh failure: sign out and return [`FetchError::Unauthenticated`]
    /// - anything else: returned unmodified
    ///
    /// The wrapper owns the `Authorization` header and replaces any caller value.
    /// A stored token that is not a valid header value is dropped with a warning,
    /// so the request goes out unauthenticated and its 401 takes the refresh path.
    ///
    /// Streaming bodies are rejected with [`FetchError::RequestNotCloneable`]
    /// before sending; use [`Self::send_with`] for those.
    pub async fn authenticated_fetch(&self, request: Request) -> Result<Response, FetchError> {
        // Keep a pristine copy for the retry before anything is sent
        let retry = request.try_clone().ok_or(FetchError::RequestNotCloneable)?;
        self.fetch_with_retry(request, move || Ok(retry)).await
    }

    async fn fetch_with_retry<R>(&self, request: Request, rebuild: R) -> Result<Response, FetchError>
    where
        R: FnOnce() -> Result<Request, FetchError>,
    {
        let method = request.method().clone();
        let url = request.url().clone();

        let token = self.session.access_token().await?;
        if token.is_none() {
            tracing::debug!(url = %url, "No access token stored, sending without Authorization");
        }

        let response = self.execute(request, token.as_deref(), 1).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!(method = %method, url = %url, "Received 401, refreshing token and retrying...");

        let record = match self.session.refresh_after_rejection(token.as_deref()).await {
            Ok(record) => record,
            Err(RefreshError::Storage(e)) => return Err(e.into()),
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                self.session.sign_out().await?;
                return Err(FetchError::Unauthenticated);
            }
        };

        let retry = rebuild()?;
        let response = self.execute(retry, Some(&record.access_token), 2).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(
                method = %method,
                url = %url,
                "Request still unauthorized after refresh, returning response as-is"
            );
        }

        Ok(response)
    }

    async fn execute(
        &self,
        mut request: Request,
        token: Option<&str>,
        attempt: u32,
    ) -> Result<Response, FetchError> {
        if let Some(token) = token {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    request.headers_mut().insert(AUTHORIZATION, value);
                }
                Err(_) => {
                    tracing::warn!("Stored access token is not a valid header value, dropping Authorization");
                }
            }
        }

        let url = request.url().clone();
        tracing::debug!(attempt, method = %request.method(), url = %url, "Executing request attempt");

        match self.client.execute(request).await {
            Ok(response) => {
                tracing::debug!(attempt, status = %response.status(), "Received HTTP response");
                Ok(response)
            }
            Err(e) => {
                // Categorize the error for better debugging
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else if e.is_body() {
                    "body_error"
                } else {
                    "unknown"
                };

                tracing::warn!(
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    attempt,
                    "HTTP request error"
                );

                Err(FetchError::Transport(e))
            }
        }
    }
}
