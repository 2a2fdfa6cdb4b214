use anyhow::{Context, Result};
use reqwest::Url;
use std::path::PathBuf;

/// Application name used for the default data directory
const APP_NAME: &str = "farmus";

/// Credential database file name inside the data directory
const CREDENTIAL_DB_FILE: &str = "credentials.sqlite3";

/// Default wallet backend (cart and wallet resources live here)
const DEFAULT_WALLET_BASE_URL: &str = "https://farmus-wallet-backend.vercel.app/";

#[derive(Clone, Debug)]
pub struct Config {
    // Backend endpoints
    pub api_base_url: String,
    pub wallet_base_url: String,
    pub refresh_path: String,

    // Token lifecycle
    pub token_lifetime_secs: u64,
    pub expiry_leeway_secs: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Credential storage
    pub credential_db_file: PathBuf,
    pub credential_scope: String,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/".to_string(),
            wallet_base_url: DEFAULT_WALLET_BASE_URL.to_string(),
            refresh_path: "api/auth/refresh-token".to_string(),
            token_lifetime_secs: 3600,
            expiry_leeway_secs: 0,
            http_connect_timeout: 30,
            http_request_timeout: 30,
            credential_db_file: default_credential_db_file(),
            credential_scope: APP_NAME.to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load configuration with priority: ENV (including `.env`) > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let config = Config {
            api_base_url: std::env::var("FARMUS_API_BASE_URL")
                .map(|s| normalize_base_url(&s))
                .unwrap_or(defaults.api_base_url),

            wallet_base_url: std::env::var("FARMUS_WALLET_BASE_URL")
                .map(|s| normalize_base_url(&s))
                .unwrap_or(defaults.wallet_base_url),

            refresh_path: std::env::var("FARMUS_REFRESH_PATH")
                .map(|s| s.trim_start_matches('/').to_string())
                .unwrap_or(defaults.refresh_path),

            token_lifetime_secs: env_number("FARMUS_TOKEN_LIFETIME")?
                .unwrap_or(defaults.token_lifetime_secs),

            expiry_leeway_secs: env_number("FARMUS_EXPIRY_LEEWAY")?
                .unwrap_or(defaults.expiry_leeway_secs),

            http_connect_timeout: env_number("HTTP_CONNECT_TIMEOUT")?
                .unwrap_or(defaults.http_connect_timeout),

            http_request_timeout: env_number("HTTP_REQUEST_TIMEOUT")?
                .unwrap_or(defaults.http_request_timeout),

            credential_db_file: std::env::var("FARMUS_CREDENTIAL_DB")
                .map(|s| expand_tilde(&s))
                .unwrap_or(defaults.credential_db_file),

            credential_scope: std::env::var("FARMUS_CREDENTIAL_SCOPE")
                .unwrap_or(defaults.credential_scope),

            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),

            log_format: parse_log_format(&std::env::var("LOG_FORMAT").unwrap_or_default()),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid FARMUS_API_BASE_URL: {}", self.api_base_url))?;
        Url::parse(&self.wallet_base_url)
            .with_context(|| format!("Invalid FARMUS_WALLET_BASE_URL: {}", self.wallet_base_url))?;

        if self.token_lifetime_secs == 0 {
            anyhow::bail!("FARMUS_TOKEN_LIFETIME must be greater than zero");
        }

        if self.credential_scope.is_empty() {
            anyhow::bail!("FARMUS_CREDENTIAL_SCOPE cannot be empty");
        }

        Ok(())
    }

    /// Token lifetime as a chrono duration
    pub fn token_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_lifetime_secs as i64)
    }

    /// Expiry leeway as a chrono duration
    pub fn expiry_leeway(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_leeway_secs as i64)
    }
}

/// Read an optional numeric environment variable, failing on garbage
fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a non-negative integer, got {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}

/// Base URLs are joined with relative paths, so they must end with a slash
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

fn default_credential_db_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
        .join(CREDENTIAL_DB_FILE)
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
