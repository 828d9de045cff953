//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use calmirror_core::{CalendarEvent, CalendarInfo, Reminder, SyncStatistics, SyncStatus};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
#[derive(Debug, Clone, Copy)]
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print a list of calendars
    pub fn print_calendars(&self, calendars: &[CalendarInfo]) {
        match self.format {
            OutputFormat::Human => {
                if calendars.is_empty() {
                    println!("No calendars mirrored.");
                    return;
                }
                for calendar in calendars {
                    let access = if calendar.is_writable { "" } else { " (read-only)" };
                    println!(
                        "{} | {} | {}{}",
                        truncate(&calendar.external_id, 20),
                        truncate(&calendar.title, 30),
                        calendar.kind.as_str(),
                        access
                    );
                }
                println!("\n{} calendar(s)", calendars.len());
            }
            OutputFormat::Json => print_json(calendars),
            OutputFormat::Quiet => {
                for calendar in calendars {
                    println!("{}", calendar.external_id);
                }
            }
        }
    }

    /// Print a list of events
    pub fn print_events(&self, events: &[CalendarEvent]) {
        match self.format {
            OutputFormat::Human => {
                if events.is_empty() {
                    println!("No events found.");
                    return;
                }
                for event in events {
                    let when = if event.is_all_day {
                        format!("{} (all day)", local(event.start).format("%Y-%m-%d"))
                    } else {
                        format!(
                            "{} - {}",
                            local(event.start).format("%Y-%m-%d %H:%M"),
                            local(event.end).format("%H:%M")
                        )
                    };
                    let place = event
                        .location
                        .as_deref()
                        .map(|l| format!(" @ {}", truncate(l, 25)))
                        .unwrap_or_default();
                    println!("{} | {}{}", when, truncate(&event.title, 40), place);
                }
                println!("\n{} event(s)", events.len());
            }
            OutputFormat::Json => print_json(events),
            OutputFormat::Quiet => {
                for event in events {
                    println!("{}", event.external_id);
                }
            }
        }
    }

    /// Print a list of reminders
    pub fn print_reminders(&self, reminders: &[Reminder]) {
        match self.format {
            OutputFormat::Human => {
                if reminders.is_empty() {
                    println!("No reminders found.");
                    return;
                }
                let now = Utc::now();
                for reminder in reminders {
                    let mark = if reminder.is_completed { "[x]" } else { "[ ]" };
                    let due = match reminder.due {
                        Some(due) if reminder.is_overdue(now) => {
                            format!(" (overdue since {})", local(due).format("%Y-%m-%d"))
                        }
                        Some(due) => format!(" (due {})", local(due).format("%Y-%m-%d %H:%M")),
                        None => String::new(),
                    };
                    println!("{} {}{}", mark, truncate(&reminder.title, 50), due);
                }
                println!("\n{} reminder(s)", reminders.len());
            }
            OutputFormat::Json => print_json(reminders),
            OutputFormat::Quiet => {
                for reminder in reminders {
                    println!("{}", reminder.external_id);
                }
            }
        }
    }

    /// Print the outcome of a sync run
    pub fn print_sync_report(&self, status: &SyncStatus, stats: &SyncStatistics) {
        match self.format {
            OutputFormat::Human => {
                match status {
                    SyncStatus::Error(cause) => println!("✗ Sync failed: {}", cause),
                    _ => println!("✓ Sync complete: {}", status),
                }
                if let Some(result) = stats.last_result {
                    println!("  Changes:  {}", result);
                }
                if let Some(duration) = stats.last_cycle_duration {
                    println!("  Duration: {:.2?}", duration);
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": status,
                        "statistics": stats,
                    })
                );
            }
            OutputFormat::Quiet => {
                if let SyncStatus::Synced(count) = status {
                    println!("{}", count);
                }
            }
        }
    }

    /// Print a status change while watching
    pub fn print_status_change(&self, status: &SyncStatus) {
        match self.format {
            OutputFormat::Human => {
                println!("[{}] {}", Local::now().format("%H:%M:%S"), status);
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"at": Utc::now(), "status": status})
                );
            }
            OutputFormat::Quiet => {
                if let SyncStatus::Error(cause) = status {
                    eprintln!("{}", cause);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode output: {}", e),
    }
}

fn local(at: DateTime<Utc>) -> DateTime<Local> {
    at.with_timezone(&Local)
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("Café über alles", 8), "Café ...");
    }
}
