//! Sync coordination
//!
//! Runs reconciliation cycles against the mirror and reports their outcome.
//!
//! ## Usage
//!
//! ```ignore
//! let sync = SyncCoordinator::new(source, store, config.sync.clone())?;
//! sync.on_status_changed(|status| println!("{}", status));
//! sync.start().await?;
//! ```

mod coordinator;
mod error;
mod stats;
mod status;

pub use coordinator::{StatusCallback, SyncCoordinator, SyncTrigger};
pub use error::SyncError;
pub use stats::SyncStatistics;
pub use status::{ErrorCause, ErrorKind, SyncStatus};
