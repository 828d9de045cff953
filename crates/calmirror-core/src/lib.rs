//! CalMirror Core Library
//!
//! This crate keeps a local, queryable mirror of a calendar provider's
//! calendars, events and reminders.
//!
//! # Architecture
//!
//! - **Source**: the provider, read through the `EventSource` trait
//! - **Mirror**: SQLite (or in-memory) tables holding the last snapshot
//! - **Coordinator**: decides when to resync and runs one cycle at a time
//!
//! Every cycle fetches a full snapshot for the configured scope and
//! reconciles it against the mirror inside a single transaction.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let store = Arc::new(SqliteMirror::open(&config)?);
//! let source = Arc::new(FileSource::new(export_path));
//!
//! let sync = SyncCoordinator::new(source, store, config.sync.clone())?;
//! sync.start().await?;
//!
//! let upcoming = sync.events_in_range(DateWindow::around(Utc::now(), 0, 7))?;
//! ```
//!
//! # Modules
//!
//! - `models`: Calendars, events and reminders
//! - `detect`: Field-level change detection
//! - `scope`: Calendar filter and date window
//! - `reconcile`: Snapshot diffing and the reconcile transaction
//! - `source`: Provider trait plus in-memory and file-backed sources
//! - `storage`: Mirror stores and queries
//! - `sync`: Coordinator, status and statistics
//! - `config`: Application configuration

pub mod config;
pub mod detect;
pub mod models;
pub mod reconcile;
pub mod scope;
pub mod source;
pub mod storage;
pub mod sync;

pub use config::{Config, ConfigError, SyncSettings};
pub use models::{
    CalendarEvent, CalendarInfo, CalendarKind, EntityKind, EventStatus, MirrorEntity, Reminder,
};
pub use reconcile::{apply_snapshot, reconcile, SnapshotResult, SyncResult};
pub use scope::{DateWindow, FetchScope, Scope};
pub use source::{
    AccessMode, ChangeNotice, EventSource, FileSource, MemorySource, SourceError, SourceExport,
    SourceResult, SourceSnapshot,
};
pub use storage::{
    MemoryMirror, MirrorCounts, MirrorQuery, MirrorStore, MirrorTransaction, MirrorTx,
    ReminderFilter, SqliteMirror, StorageError, StorageResult,
};
pub use sync::{
    ErrorCause, ErrorKind, SyncCoordinator, SyncError, SyncStatistics, SyncStatus, SyncTrigger,
};
