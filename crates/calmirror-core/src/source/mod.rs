//! Source providers
//!
//! The source is the authoritative calendar/reminder store being mirrored.
//! Implementations answer access requests, return full snapshots for a
//! scope, and optionally push change notices. A notice carries no payload:
//! receiving one means "something changed, rescan".

pub mod file;
pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::{CalendarEvent, CalendarInfo, EntityKind, Reminder};
use crate::scope::{FetchScope, Scope};

pub use file::{FileSource, SourceExport};
pub use memory::{AccessMode, MemorySource};

/// Capacity of change notice channels; lagging receivers only lose
/// duplicate "rescan" signals
pub const NOTICE_CHANNEL_CAPACITY: usize = 16;

/// Errors raised by a source
#[derive(Error, Debug)]
pub enum SourceError {
    /// The user or platform refused access
    #[error("Access to the calendar store was denied")]
    AccessDenied,

    /// A fetch failed
    #[error("Failed to fetch {kind} records: {message}")]
    Fetch {
        kind: EntityKind,
        message: String,
        retryable: bool,
    },

    /// The source cannot be reached at all right now
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// Export data could not be parsed
    #[error("Failed to decode source data from '{path}': {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Export file could not be read
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    /// Whether the same request might succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Fetch { retryable, .. } => *retryable,
            SourceError::Unavailable(_) | SourceError::Io { .. } => true,
            SourceError::AccessDenied | SourceError::Decode { .. } => false,
        }
    }
}

/// Result type for source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// "Something changed in the source"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice;

/// Everything fetched in one cycle
///
/// Kinds that are disabled come back as `None` and are left alone by
/// reconciliation.
#[derive(Debug, Clone, Default)]
pub struct SourceSnapshot {
    pub calendars: Vec<CalendarInfo>,
    pub events: Option<Vec<CalendarEvent>>,
    pub reminders: Option<Vec<Reminder>>,
}

impl SourceSnapshot {
    /// Number of records fetched
    pub fn len(&self) -> usize {
        self.calendars.len()
            + self.events.as_ref().map_or(0, Vec::len)
            + self.reminders.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Authoritative calendar/reminder store
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Ask for read access; `Ok(false)` means denied
    async fn request_access(&self) -> SourceResult<bool>;

    /// All calendars and reminder lists
    async fn fetch_calendars(&self) -> SourceResult<Vec<CalendarInfo>>;

    /// Events inside the scope (calendar filter and date window)
    async fn fetch_events(&self, scope: &FetchScope) -> SourceResult<Vec<CalendarEvent>>;

    /// Reminders in the selected lists
    async fn fetch_reminders(&self, scope: &Scope) -> SourceResult<Vec<Reminder>>;

    /// Change notices, `None` if the source cannot push them
    fn subscribe_changes(&self) -> Option<broadcast::Receiver<ChangeNotice>>;
}
