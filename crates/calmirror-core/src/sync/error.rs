//! Sync errors

use thiserror::Error;

use crate::config::ConfigError;
use crate::source::SourceError;
use crate::storage::StorageError;
use crate::sync::status::{ErrorCause, ErrorKind};

/// Errors raised by the sync coordinator
#[derive(Error, Debug)]
pub enum SyncError {
    /// Read access to the source was refused or never answered
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The source failed while fetching a snapshot
    #[error("Provider fetch failed: {0}")]
    ProviderFetch(#[source] SourceError),

    /// The mirror transaction failed and was rolled back
    #[error("Store transaction failed: {0}")]
    StoreTransaction(#[from] StorageError),

    /// Settings failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    /// A cycle is already queued or running
    #[error("A sync cycle is already in progress")]
    AlreadyInProgress,

    /// The coordinator has not been started
    #[error("Sync coordinator is not running")]
    NotRunning,

    /// A background task died unexpectedly
    #[error("Sync worker failed: {0}")]
    Worker(String),
}

impl SyncError {
    /// Whether the cycle should be retried with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ProviderFetch(e) => e.is_retryable(),
            SyncError::StoreTransaction(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Status payload describing this error
    pub fn cause(&self) -> ErrorCause {
        let kind = match self {
            SyncError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SyncError::ProviderFetch(SourceError::AccessDenied) => ErrorKind::PermissionDenied,
            SyncError::ProviderFetch(_) => ErrorKind::ProviderFetch,
            SyncError::StoreTransaction(_) => ErrorKind::StoreTransaction,
            _ => ErrorKind::Internal,
        };
        ErrorCause::new(kind, self.to_string())
    }
}

impl From<SourceError> for SyncError {
    fn from(err: SourceError) -> Self {
        SyncError::ProviderFetch(err)
    }
}
