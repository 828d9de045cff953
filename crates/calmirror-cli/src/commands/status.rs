//! Status command handler

use anyhow::{Context, Result};

use calmirror_core::{Config, MirrorStore, SqliteMirror};

use crate::output::{Output, OutputFormat};

/// Show mirror location, row counts and sync settings
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let mirror = SqliteMirror::open(config).context("Failed to open mirror")?;
    let counts = mirror.counts()?;
    let schema = mirror.schema_version()?;
    let path = config.sqlite_path();
    let db_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let sync = &config.sync;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "database": path,
                    "database_size": db_size,
                    "schema_version": schema,
                    "counts": counts,
                    "sync": {
                        "periodic_sync_enabled": sync.periodic_sync_enabled,
                        "periodic_interval_secs": sync.periodic_interval_secs,
                        "notification_sync_enabled": sync.notification_sync_enabled,
                        "calendars": sync.calendars,
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", counts.total());
        }
        OutputFormat::Human => {
            println!("CalMirror Status");
            println!("================");
            println!();
            println!("Storage:");
            println!("  Location: {}", path.display());
            println!("  Size:     {}", human_size(db_size));
            println!(
                "  Schema:   {}",
                schema.map(|v| v.to_string()).unwrap_or_else(|| "(none)".to_string())
            );
            println!();
            println!("Contents:");
            println!("  Calendars: {}", counts.calendars);
            println!("  Events:    {}", counts.events);
            println!("  Reminders: {}", counts.reminders);
            println!();
            println!("Sync:");
            if sync.periodic_sync_enabled {
                println!("  Periodic:      every {}s", sync.periodic_interval_secs);
            } else {
                println!("  Periodic:      disabled");
            }
            println!(
                "  Notifications: {}",
                if sync.notification_sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            match &sync.calendars {
                Some(ids) => println!("  Calendars:     {}", ids.join(", ")),
                None => println!("  Calendars:     all"),
            }
        }
    }

    Ok(())
}

fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    }
}
