//! Sync status

use std::fmt;

use serde::Serialize;

/// Category of a sync failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    ProviderFetch,
    StoreTransaction,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::ProviderFetch => "provider fetch",
            ErrorKind::StoreTransaction => "store transaction",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Why the last sync failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCause {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorCause {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Observable coordinator status
///
/// `Idle -> Syncing -> Synced(n) | Error(..)`, and back to `Syncing` on
/// the next cycle. `stop()` always returns to `Idle`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Not syncing; initial state and the state after stop
    #[default]
    Idle,
    /// A cycle is running (or waiting to retry)
    Syncing,
    /// Last cycle committed; total rows in the mirror
    Synced(usize),
    /// Last cycle failed
    Error(ErrorCause),
}

impl SyncStatus {
    /// Whether no cycle is running
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Synced(_) | SyncStatus::Error(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SyncStatus::Error(_))
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Synced(count) => write!(f, "synced ({} records)", count),
            SyncStatus::Error(cause) => write!(f, "error ({})", cause),
        }
    }
}
