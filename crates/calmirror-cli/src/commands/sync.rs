//! Sync command handler

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use calmirror_core::{Config, FileSource, SqliteMirror, SyncCoordinator, SyncError, SyncStatus};

use crate::output::Output;

/// Run one sync cycle against an export file
pub async fn sync(config: &Config, source: PathBuf, output: &Output) -> Result<()> {
    if !source.exists() {
        bail!("Source file not found: {}", source.display());
    }

    let store = Arc::new(SqliteMirror::open(config).context("Failed to open mirror")?);
    // One cycle only; no timers or change listeners
    let settings = config
        .sync
        .clone()
        .with_periodic_sync(false)
        .with_notification_sync(false);

    let coordinator = SyncCoordinator::new(Arc::new(FileSource::new(&source)), store, settings)
        .context("Invalid sync settings")?;
    let mut status = coordinator.subscribe_status();

    output.message(&format!("Syncing from {}...", source.display()));

    match coordinator.start().await {
        Ok(()) => {}
        Err(SyncError::PermissionDenied(reason)) => {
            bail!("Cannot read {}: {}", source.display(), reason)
        }
        Err(e) => return Err(e.into()),
    }

    let finished = status
        .wait_for(SyncStatus::is_terminal)
        .await
        .context("Sync coordinator shut down unexpectedly")?
        .clone();
    debug!("Sync finished with status {}", finished);

    coordinator.stop();
    output.print_sync_report(&finished, &coordinator.current_statistics());

    if let SyncStatus::Error(cause) = finished {
        bail!("Sync failed: {}", cause);
    }
    Ok(())
}
