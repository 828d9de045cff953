//! Watch command handler

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use calmirror_core::{Config, FileSource, SqliteMirror, SyncCoordinator};

use crate::output::Output;

/// Keep the mirror in step with an export file until Ctrl-C
pub async fn watch(
    config: &Config,
    source: PathBuf,
    poll_secs: u64,
    output: &Output,
) -> Result<()> {
    if poll_secs == 0 {
        bail!("Poll interval must be at least one second");
    }

    let store = Arc::new(SqliteMirror::open(config).context("Failed to open mirror")?);
    let file = FileSource::new(&source).with_poll_interval(Duration::from_secs(poll_secs));
    let coordinator = SyncCoordinator::new(Arc::new(file), store, config.sync.clone())
        .context("Invalid sync settings")?;

    let printer = *output;
    coordinator.on_status_changed(move |status| printer.print_status_change(status));

    output.message(&format!(
        "Watching {} (Ctrl-C to stop)...",
        source.display()
    ));
    coordinator.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    coordinator.stop();
    let stats = coordinator.current_statistics();
    info!(
        "Watch ended after {} cycles ({} failed)",
        stats.completed_cycles(),
        stats.failed_cycles
    );
    output.success(&format!(
        "Stopped after {} sync cycle(s), {} failed",
        stats.completed_cycles(),
        stats.failed_cycles
    ));

    Ok(())
}
