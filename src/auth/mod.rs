// Authentication module
// Credential persistence, token refresh and session state

mod credentials;
mod expiry;
mod refresh;
mod session;
mod types;

pub use credentials::{
    clear_record, read_record, write_record, CredentialStore, MemoryCredentialStore,
    SqliteCredentialStore,
};
pub use expiry::{expiry_after, is_expired, is_expired_with_leeway};
pub use refresh::{refresh_credentials, RefreshEndpoint, RefreshResult, TokenRefresher};
pub use session::Session;
pub use types::{
    CredentialRecord, SessionPhase, SessionState, ACCESS_TOKEN_EXPIRY_KEY, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
};
