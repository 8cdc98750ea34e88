use thiserror::Error;

use crate::storage::StorageError;

/// Errors that end a sync cycle.
///
/// Every variant leaves the local store and the cursor as they were before
/// the cycle started.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another cycle is running on this library. Retry later.
    #[error("A sync is already in progress")]
    InProgress,

    /// A remote call exceeded its timeout
    #[error("Sync request timed out")]
    Timeout,

    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Sync request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-2xx response after retries
    #[error("Sync service returned HTTP {0}")]
    HttpStatus(u16),

    /// The service rejected the credentials
    #[error("Sync service rejected the credentials")]
    Unauthorized,

    /// The response body is not what the protocol describes
    #[error("Invalid response from sync service: {0}")]
    InvalidResponse(String),

    /// Cancelled before the push began
    #[error("Sync cancelled")]
    Cancelled,

    /// Sync is switched off, or no server/credentials are configured
    #[error("Sync is disabled: {0}")]
    Disabled(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Whether running the cycle again later can succeed without user
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::InProgress | SyncError::Timeout | SyncError::Network(_) => true,
            SyncError::HttpStatus(status) => *status == 429 || (500..600).contains(status),
            SyncError::Storage(StorageError::InstanceLocked) => true,
            SyncError::Unauthorized
            | SyncError::InvalidResponse(_)
            | SyncError::Cancelled
            | SyncError::Disabled(_)
            | SyncError::Storage(_) => false,
        }
    }
}
