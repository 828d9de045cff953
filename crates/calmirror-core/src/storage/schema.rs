//! SQLite schema for the mirror
//!
//! The source remains the source of truth; this database holds a copy of
//! it that is safe to drop and rebuild with a full sync. Timestamps are
//! stored as milliseconds since the Unix epoch.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Calendar and reminder list descriptors
        CREATE TABLE IF NOT EXISTS calendars (
            external_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            kind TEXT NOT NULL,
            color TEXT,
            source_name TEXT NOT NULL,
            is_writable INTEGER NOT NULL,
            synced_at INTEGER NOT NULL
        );

        -- Calendar events
        CREATE TABLE IF NOT EXISTS events (
            external_id TEXT PRIMARY KEY,
            calendar_id TEXT NOT NULL,
            title TEXT NOT NULL,
            notes TEXT,
            location TEXT,
            url TEXT,
            start_at INTEGER NOT NULL,
            end_at INTEGER NOT NULL,
            is_all_day INTEGER NOT NULL,
            status TEXT NOT NULL,
            has_recurrence INTEGER NOT NULL,
            created_at INTEGER,
            last_modified INTEGER,
            synced_at INTEGER NOT NULL
        );

        -- Reminders
        CREATE TABLE IF NOT EXISTS reminders (
            external_id TEXT PRIMARY KEY,
            list_id TEXT NOT NULL,
            title TEXT NOT NULL,
            notes TEXT,
            due_at INTEGER,
            is_completed INTEGER NOT NULL,
            completed_at INTEGER,
            priority INTEGER NOT NULL,
            has_recurrence INTEGER NOT NULL,
            created_at INTEGER,
            last_modified INTEGER,
            synced_at INTEGER NOT NULL
        );

        -- Indexes for common query patterns

        -- Events by calendar and by time range
        CREATE INDEX IF NOT EXISTS idx_events_calendar_id ON events(calendar_id);
        CREATE INDEX IF NOT EXISTS idx_events_start_at ON events(start_at);
        CREATE INDEX IF NOT EXISTS idx_events_end_at ON events(end_at);

        -- Reminders by list, due date and completion
        CREATE INDEX IF NOT EXISTS idx_reminders_list_id ON reminders(list_id);
        CREATE INDEX IF NOT EXISTS idx_reminders_due_at ON reminders(due_at);
        CREATE INDEX IF NOT EXISTS idx_reminders_is_completed ON reminders(is_completed);

        -- Full-text search (FTS5)
        -- Events: search title, notes, location
        CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
            title,
            notes,
            location,
            content='events',
            content_rowid='rowid'
        );

        -- Reminders: search title and notes
        CREATE VIRTUAL TABLE IF NOT EXISTS reminders_fts USING fts5(
            title,
            notes,
            content='reminders',
            content_rowid='rowid'
        );

        -- Triggers to keep FTS in sync with main tables

        -- Events FTS triggers
        CREATE TRIGGER IF NOT EXISTS events_ai AFTER INSERT ON events BEGIN
            INSERT INTO events_fts(rowid, title, notes, location)
            VALUES (NEW.rowid, NEW.title, NEW.notes, NEW.location);
        END;

        CREATE TRIGGER IF NOT EXISTS events_ad AFTER DELETE ON events BEGIN
            INSERT INTO events_fts(events_fts, rowid, title, notes, location)
            VALUES ('delete', OLD.rowid, OLD.title, OLD.notes, OLD.location);
        END;

        CREATE TRIGGER IF NOT EXISTS events_au AFTER UPDATE ON events BEGIN
            INSERT INTO events_fts(events_fts, rowid, title, notes, location)
            VALUES ('delete', OLD.rowid, OLD.title, OLD.notes, OLD.location);
            INSERT INTO events_fts(rowid, title, notes, location)
            VALUES (NEW.rowid, NEW.title, NEW.notes, NEW.location);
        END;

        -- Reminders FTS triggers
        CREATE TRIGGER IF NOT EXISTS reminders_ai AFTER INSERT ON reminders BEGIN
            INSERT INTO reminders_fts(rowid, title, notes)
            VALUES (NEW.rowid, NEW.title, NEW.notes);
        END;

        CREATE TRIGGER IF NOT EXISTS reminders_ad AFTER DELETE ON reminders BEGIN
            INSERT INTO reminders_fts(reminders_fts, rowid, title, notes)
            VALUES ('delete', OLD.rowid, OLD.title, OLD.notes);
        END;

        CREATE TRIGGER IF NOT EXISTS reminders_au AFTER UPDATE ON reminders BEGIN
            INSERT INTO reminders_fts(reminders_fts, rowid, title, notes)
            VALUES ('delete', OLD.rowid, OLD.title, OLD.notes);
            INSERT INTO reminders_fts(rowid, title, notes)
            VALUES (NEW.rowid, NEW.title, NEW.notes);
        END;
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
