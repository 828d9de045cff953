//! Storage layer
//!
//! Local mirror of the source's calendars, events and reminders.
//!
//! ## Architecture
//!
//! - **Source**: Source of truth, read through [`crate::source::EventSource`]
//! - **Mirror**: Local copy behind [`MirrorStore`], either SQLite or in memory
//!
//! The reconciliation engine is the only writer. Everything else reads
//! through [`MirrorQuery`].

pub mod error;
pub mod memory;
pub mod mirror;
pub mod schema;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryMirror;
pub use mirror::{
    MirrorCounts, MirrorQuery, MirrorStore, MirrorTransaction, MirrorTx, ReminderFilter,
};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use sqlite::SqliteMirror;
