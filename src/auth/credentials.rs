// Credential persistence
// Key-value stores plus the record-level read/write/clear helpers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::Mutex;

use super::types::{
    CredentialRecord, ACCESS_TOKEN_EXPIRY_KEY, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
use crate::error::StorageError;

/// Scoped asynchronous key-value capability holding the credential record
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Get a value by key
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Set a value, replacing any existing one
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a value. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory store
///
/// Process-local; suitable for testing and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: DashMap<String, String>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Durable store backed by a SQLite table
///
/// Every row carries a scope so several applications (or accounts) can share
/// one database file without seeing each other's keys.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    scope: String,
}

impl SqliteCredentialStore {
    /// Open (or create) the credential database at `path`
    pub fn open(path: &Path, scope: impl Into<String>) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError(format!(
                    "Failed to create credential directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        tracing::debug!("Opening credential database: {}", path.display());
        let conn = Connection::open(path)?;
        Self::with_connection(conn, scope)
    }

    /// Store backed by a private in-memory database
    pub fn open_in_memory(scope: impl Into<String>) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, scope)
    }

    fn with_connection(conn: Connection, scope: impl Into<String>) -> Result<Self, StorageError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS credential_kv (
                scope TEXT NOT NULL,
                key   TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (scope, key)
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            scope: scope.into(),
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM credential_kv WHERE scope = ?1 AND key = ?2",
                [self.scope.as_str(), key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO credential_kv (scope, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value",
            [self.scope.as_str(), key, value],
        )?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM credential_kv WHERE scope = ?1 AND key = ?2",
            [self.scope.as_str(), key],
        )?;
        Ok(())
    }
}

/// Read the credential record.
///
/// Returns `None` unless both tokens are present. A missing or unparseable
/// expiry is returned as `None` inside the record.
pub async fn read_record(
    store: &dyn CredentialStore,
) -> Result<Option<CredentialRecord>, StorageError> {
    let access_token = store.get(ACCESS_TOKEN_KEY).await?;
    let refresh_token = store.get(REFRESH_TOKEN_KEY).await?;

    let (access_token, refresh_token) = match (access_token, refresh_token) {
        (Some(a), Some(r)) if !a.is_empty() && !r.is_empty() => (a, r),
        (None, None) => return Ok(None),
        _ => {
            tracing::warn!("Partial credential record in store, treating as signed out");
            return Ok(None);
        }
    };

    let access_token_expiry = match store.get(ACCESS_TOKEN_EXPIRY_KEY).await? {
        Some(raw) => {
            let parsed = decode_expiry(&raw);
            if parsed.is_none() {
                tracing::warn!("Unparseable token expiry {:?}, treating as expired", raw);
            }
            parsed
        }
        None => None,
    };

    Ok(Some(CredentialRecord {
        access_token,
        refresh_token,
        access_token_expiry,
    }))
}

/// Write a full credential record, access token last.
///
/// There is no multi-key transaction: a crash part-way leaves the refresh
/// token and expiry without an access token, which reads back as signed out.
pub async fn write_record(
    store: &dyn CredentialStore,
    record: &CredentialRecord,
) -> Result<(), StorageError> {
    store.set(REFRESH_TOKEN_KEY, &record.refresh_token).await?;
    match record.access_token_expiry {
        Some(expiry) => {
            store
                .set(ACCESS_TOKEN_EXPIRY_KEY, &encode_expiry(expiry))
                .await?
        }
        None => store.remove(ACCESS_TOKEN_EXPIRY_KEY).await?,
    }
    store.set(ACCESS_TOKEN_KEY, &record.access_token).await
}

/// Remove all three record fields, access token first
pub async fn clear_record(store: &dyn CredentialStore) -> Result<(), StorageError> {
    store.remove(ACCESS_TOKEN_KEY).await?;
    store.remove(ACCESS_TOKEN_EXPIRY_KEY).await?;
    store.remove(REFRESH_TOKEN_KEY).await
}

fn encode_expiry(expiry: DateTime<Utc>) -> String {
    expiry.timestamp_millis().to_string()
}

fn decode_expiry(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}
