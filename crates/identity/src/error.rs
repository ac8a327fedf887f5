//! Error types for the identity core.
//!
//! These cover unexpected failures only. Expected outcomes of external
//! synchronization (already registered, already bound, app not activated,
//! credential rejected) are modeled as structured outcome values in the
//! provisioner and synchronizer, never as `Err`.

use thiserror::Error;
use uuid::Uuid;

pub type IdentityResult<T> = Result<T, IdentityError>;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("tenant API request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response from the tenant API, body truncated for logging.
    #[error("tenant API returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] subflow_shared::ConfigError),

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    /// A differing tenant id is already persisted for this user. The core
    /// never overwrites an assigned tenant id.
    #[error("tenant id conflict for user {user_id}: existing {existing}, attempted {attempted}")]
    TenantIdConflict {
        user_id: Uuid,
        existing: String,
        attempted: String,
    },

    #[error("invalid filter: {0}")]
    InvalidFilter(&'static str),

    #[error("invariant violation: {0}")]
    Invariant(&'static str),
}
