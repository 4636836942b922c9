//! Error types for the care store and its sync engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A logical id or version UUID is already taken.
    #[error("Identifier conflict: {0}")]
    IdentifierConflict(String),

    /// An update was attempted against a version that is no longer the head.
    #[error("Stale head: {0}")]
    StaleHead(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The write would leave outcomes addressed by the wrong task version.
    #[error("Data loss rejected: {0}")]
    DataLossRejected(String),

    #[error("A synchronization is already in progress")]
    SyncBusy,

    #[error("Remote synchronization failed: {0}")]
    RemoteSyncFailed(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the same call may succeed if simply tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::SyncBusy | StoreError::RemoteSyncFailed(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
