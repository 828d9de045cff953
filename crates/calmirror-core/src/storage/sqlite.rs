//! SQLite mirror store
//!
//! Holds the local copy of the source in a single SQLite database. The
//! connection sits behind a mutex, so a reader sees the mirror either
//! before or after a reconciliation transaction, never halfway through.
//!
//! ## Tables
//!
//! - `calendars` - Calendar and reminder list descriptors
//! - `events` - Calendar events
//! - `reminders` - Reminders
//! - `events_fts` / `reminders_fts` - Full-text search (auto-synced via triggers)
//!
//! Rows are written with `INSERT ... ON CONFLICT DO UPDATE` so a row keeps
//! its rowid (and its FTS entry) across updates.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{CalendarEvent, CalendarInfo, CalendarKind, EventStatus, Reminder};
use crate::scope::FetchScope;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::mirror::{
    sort_events, sort_reminders, MirrorQuery, MirrorStore, MirrorTransaction, MirrorTx,
};
use crate::storage::schema::{get_schema_version, init_schema, needs_init};

/// Upper bound on bound parameters in one statement
const MAX_PARAMS_PER_STATEMENT: usize = 900;

const CALENDAR_COLUMNS: &str =
    "external_id, title, kind, color, source_name, is_writable, synced_at";

const EVENT_COLUMNS: &str = "external_id, calendar_id, title, notes, location, url, start_at, \
     end_at, is_all_day, status, has_recurrence, created_at, last_modified, synced_at";

const REMINDER_COLUMNS: &str = "external_id, list_id, title, notes, due_at, is_completed, \
     completed_at, priority, has_recurrence, created_at, last_modified, synced_at";

/// SQLite-backed mirror
pub struct SqliteMirror {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteMirror {
    /// Open or create the mirror database configured in `config`
    pub fn open(config: &Config) -> StorageResult<Self> {
        Self::open_at(&config.sqlite_path())
    }

    /// Open or create the mirror database at `path`
    pub fn open_at(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)?;

        if needs_init(&conn) {
            debug!("Initializing mirror schema at {:?}", path);
            init_schema(&conn)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Location of the database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Schema version recorded in the database
    pub fn schema_version(&self) -> StorageResult<Option<i32>> {
        Ok(get_schema_version(&self.conn.lock())?)
    }
}

impl MirrorStore for SqliteMirror {
    fn transaction<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut dyn MirrorTransaction) -> StorageResult<R>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let result = {
            let mut handle = SqliteTx { conn: &tx };
            f(&mut handle)
        };

        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!("Rollback failed after {}: {}", e, rollback);
                }
                Err(e)
            }
        }
    }

    fn read<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&dyn MirrorTransaction) -> StorageResult<R>,
    {
        let conn = self.conn.lock();
        let handle = SqliteTx { conn: &conn };
        f(&handle)
    }
}

impl MirrorQuery for SqliteMirror {
    fn search_events(&self, text: &str) -> StorageResult<Vec<CalendarEvent>> {
        let Some(query) = fts_query(text) else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE rowid IN (SELECT rowid FROM events_fts WHERE events_fts MATCH ?)"
        );
        let mut events = query_events(&conn, &sql, params![query])?;
        sort_events(&mut events);
        Ok(events)
    }

    fn search_reminders(&self, text: &str) -> StorageResult<Vec<Reminder>> {
        let Some(query) = fts_query(text) else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders \
             WHERE rowid IN (SELECT rowid FROM reminders_fts WHERE reminders_fts MATCH ?)"
        );
        let mut reminders = query_reminders(&conn, &sql, params![query])?;
        sort_reminders(&mut reminders);
        Ok(reminders)
    }
}

/// Turn free text into an FTS5 query: every token quoted, prefix-matched
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

// ==================== Transaction handle ====================

struct SqliteTx<'c> {
    conn: &'c Connection,
}

impl SqliteTx<'_> {
    fn count_table(&self, table: &str) -> StorageResult<usize> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn delete_from(&self, table: &str, keys: &[String]) -> StorageResult<usize> {
        let mut deleted = 0;
        for chunk in keys.chunks(MAX_PARAMS_PER_STATEMENT) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("DELETE FROM {table} WHERE external_id IN ({placeholders})");
            deleted += self.conn.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        Ok(deleted)
    }
}

impl MirrorTx<CalendarInfo> for SqliteTx<'_> {
    fn get(&self, key: &str) -> StorageResult<Option<CalendarInfo>> {
        let sql = format!("SELECT {CALENDAR_COLUMNS} FROM calendars WHERE external_id = ?");
        Ok(query_calendars(self.conn, &sql, params![key])?.into_iter().next())
    }

    fn scan(&self, scope: &FetchScope) -> StorageResult<Vec<CalendarInfo>> {
        let sql = format!("SELECT {CALENDAR_COLUMNS} FROM calendars ORDER BY title");
        let mut calendars = query_calendars(self.conn, &sql, [])?;
        calendars.retain(|c| scope.contains(c));
        Ok(calendars)
    }

    fn upsert(&mut self, calendar: &CalendarInfo) -> StorageResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO calendars (external_id, title, kind, color, source_name, is_writable, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                title = excluded.title,
                kind = excluded.kind,
                color = excluded.color,
                source_name = excluded.source_name,
                is_writable = excluded.is_writable,
                synced_at = excluded.synced_at
            "#,
            params![
                calendar.external_id,
                calendar.title,
                calendar.kind.as_str(),
                calendar.color,
                calendar.source_name,
                calendar.is_writable,
                synced_millis(calendar.synced_at),
            ],
        )?;
        Ok(())
    }

    fn delete_keys(&mut self, keys: &[String]) -> StorageResult<usize> {
        self.delete_from("calendars", keys)
    }

    fn count(&self) -> StorageResult<usize> {
        self.count_table("calendars")
    }
}

impl MirrorTx<CalendarEvent> for SqliteTx<'_> {
    fn get(&self, key: &str) -> StorageResult<Option<CalendarEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE external_id = ?");
        Ok(query_events(self.conn, &sql, params![key])?.into_iter().next())
    }

    fn scan(&self, scope: &FetchScope) -> StorageResult<Vec<CalendarEvent>> {
        let mut events = match scope.window {
            // Coarse range filter in SQL, exact overlap rule below
            Some(window) => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE end_at >= ? AND start_at <= ?"
                );
                query_events(
                    self.conn,
                    &sql,
                    params![
                        window.start.timestamp_millis(),
                        window.end.timestamp_millis()
                    ],
                )?
            }
            None => {
                let sql = format!("SELECT {EVENT_COLUMNS} FROM events");
                query_events(self.conn, &sql, [])?
            }
        };
        events.retain(|e| scope.contains(e));
        Ok(events)
    }

    fn upsert(&mut self, event: &CalendarEvent) -> StorageResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO events (external_id, calendar_id, title, notes, location, url, start_at,
                end_at, is_all_day, status, has_recurrence, created_at, last_modified, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                calendar_id = excluded.calendar_id,
                title = excluded.title,
                notes = excluded.notes,
                location = excluded.location,
                url = excluded.url,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                is_all_day = excluded.is_all_day,
                status = excluded.status,
                has_recurrence = excluded.has_recurrence,
                created_at = excluded.created_at,
                last_modified = excluded.last_modified,
                synced_at = excluded.synced_at
            "#,
            params![
                event.external_id,
                event.calendar_id,
                event.title,
                event.notes,
                event.location,
                event.url,
                event.start.timestamp_millis(),
                event.end.timestamp_millis(),
                event.is_all_day,
                event.status.as_str(),
                event.has_recurrence,
                event.created_at.map(|t| t.timestamp_millis()),
                event.last_modified.map(|t| t.timestamp_millis()),
                synced_millis(event.synced_at),
            ],
        )?;
        Ok(())
    }

    fn delete_keys(&mut self, keys: &[String]) -> StorageResult<usize> {
        self.delete_from("events", keys)
    }

    fn count(&self) -> StorageResult<usize> {
        self.count_table("events")
    }
}

impl MirrorTx<Reminder> for SqliteTx<'_> {
    fn get(&self, key: &str) -> StorageResult<Option<Reminder>> {
        let sql = format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE external_id = ?");
        Ok(query_reminders(self.conn, &sql, params![key])?.into_iter().next())
    }

    fn scan(&self, scope: &FetchScope) -> StorageResult<Vec<Reminder>> {
        let sql = format!("SELECT {REMINDER_COLUMNS} FROM reminders");
        let mut reminders = query_reminders(self.conn, &sql, [])?;
        reminders.retain(|r| scope.contains(r));
        Ok(reminders)
    }

    fn upsert(&mut self, reminder: &Reminder) -> StorageResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO reminders (external_id, list_id, title, notes, due_at, is_completed,
                completed_at, priority, has_recurrence, created_at, last_modified, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                list_id = excluded.list_id,
                title = excluded.title,
                notes = excluded.notes,
                due_at = excluded.due_at,
                is_completed = excluded.is_completed,
                completed_at = excluded.completed_at,
                priority = excluded.priority,
                has_recurrence = excluded.has_recurrence,
                created_at = excluded.created_at,
                last_modified = excluded.last_modified,
                synced_at = excluded.synced_at
            "#,
            params![
                reminder.external_id,
                reminder.list_id,
                reminder.title,
                reminder.notes,
                reminder.due.map(|t| t.timestamp_millis()),
                reminder.is_completed,
                reminder.completed_at.map(|t| t.timestamp_millis()),
                reminder.priority,
                reminder.has_recurrence,
                reminder.created_at.map(|t| t.timestamp_millis()),
                reminder.last_modified.map(|t| t.timestamp_millis()),
                synced_millis(reminder.synced_at),
            ],
        )?;
        Ok(())
    }

    fn delete_keys(&mut self, keys: &[String]) -> StorageResult<usize> {
        self.delete_from("reminders", keys)
    }

    fn count(&self) -> StorageResult<usize> {
        self.count_table("reminders")
    }
}

// ==================== Internal structs ====================

struct CalendarRow {
    external_id: String,
    title: String,
    kind: String,
    color: Option<String>,
    source_name: String,
    is_writable: bool,
    synced_at: i64,
}

struct EventRow {
    external_id: String,
    calendar_id: String,
    title: String,
    notes: Option<String>,
    location: Option<String>,
    url: Option<String>,
    start_at: i64,
    end_at: i64,
    is_all_day: bool,
    status: String,
    has_recurrence: bool,
    created_at: Option<i64>,
    last_modified: Option<i64>,
    synced_at: i64,
}

struct ReminderRow {
    external_id: String,
    list_id: String,
    title: String,
    notes: Option<String>,
    due_at: Option<i64>,
    is_completed: bool,
    completed_at: Option<i64>,
    priority: u8,
    has_recurrence: bool,
    created_at: Option<i64>,
    last_modified: Option<i64>,
    synced_at: i64,
}

// ==================== Row helpers ====================

/// Mirror rows always carry a sync stamp; unstamped input is written as now
fn synced_millis(synced_at: Option<DateTime<Utc>>) -> i64 {
    synced_at.unwrap_or_else(Utc::now).timestamp_millis()
}

fn timestamp(table: &'static str, key: &str, ms: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::corrupt(table, key, format!("timestamp {ms} out of range")))
}

fn optional_timestamp(
    table: &'static str,
    key: &str,
    ms: Option<i64>,
) -> StorageResult<Option<DateTime<Utc>>> {
    ms.map(|ms| timestamp(table, key, ms)).transpose()
}

fn query_calendars<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StorageResult<Vec<CalendarInfo>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(CalendarRow {
                external_id: row.get(0)?,
                title: row.get(1)?,
                kind: row.get(2)?,
                color: row.get(3)?,
                source_name: row.get(4)?,
                is_writable: row.get(5)?,
                synced_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(hydrate_calendar).collect()
}

fn hydrate_calendar(row: CalendarRow) -> StorageResult<CalendarInfo> {
    let kind = CalendarKind::parse(&row.kind).ok_or_else(|| {
        StorageError::corrupt("calendars", &row.external_id, format!("unknown kind '{}'", row.kind))
    })?;
    let synced_at = timestamp("calendars", &row.external_id, row.synced_at)?;
    Ok(CalendarInfo {
        external_id: row.external_id,
        title: row.title,
        kind,
        color: row.color,
        source_name: row.source_name,
        is_writable: row.is_writable,
        synced_at: Some(synced_at),
    })
}

fn query_events<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StorageResult<Vec<CalendarEvent>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(EventRow {
                external_id: row.get(0)?,
                calendar_id: row.get(1)?,
                title: row.get(2)?,
                notes: row.get(3)?,
                location: row.get(4)?,
                url: row.get(5)?,
                start_at: row.get(6)?,
                end_at: row.get(7)?,
                is_all_day: row.get(8)?,
                status: row.get(9)?,
                has_recurrence: row.get(10)?,
                created_at: row.get(11)?,
                last_modified: row.get(12)?,
                synced_at: row.get(13)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(hydrate_event).collect()
}

fn hydrate_event(row: EventRow) -> StorageResult<CalendarEvent> {
    let key = row.external_id.as_str();
    let start = timestamp("events", key, row.start_at)?;
    let end = timestamp("events", key, row.end_at)?;
    let created_at = optional_timestamp("events", key, row.created_at)?;
    let last_modified = optional_timestamp("events", key, row.last_modified)?;
    let synced_at = timestamp("events", key, row.synced_at)?;

    Ok(CalendarEvent {
        external_id: row.external_id,
        calendar_id: row.calendar_id,
        title: row.title,
        notes: row.notes,
        location: row.location,
        url: row.url,
        start,
        end,
        is_all_day: row.is_all_day,
        status: EventStatus::parse(&row.status),
        has_recurrence: row.has_recurrence,
        created_at,
        last_modified,
        synced_at: Some(synced_at),
    })
}

fn query_reminders<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StorageResult<Vec<Reminder>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(ReminderRow {
                external_id: row.get(0)?,
                list_id: row.get(1)?,
                title: row.get(2)?,
                notes: row.get(3)?,
                due_at: row.get(4)?,
                is_completed: row.get(5)?,
                completed_at: row.get(6)?,
                priority: row.get(7)?,
                has_recurrence: row.get(8)?,
                created_at: row.get(9)?,
                last_modified: row.get(10)?,
                synced_at: row.get(11)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(hydrate_reminder).collect()
}

fn hydrate_reminder(row: ReminderRow) -> StorageResult<Reminder> {
    let key = row.external_id.as_str();
    let due = optional_timestamp("reminders", key, row.due_at)?;
    let completed_at = optional_timestamp("reminders", key, row.completed_at)?;
    let created_at = optional_timestamp("reminders", key, row.created_at)?;
    let last_modified = optional_timestamp("reminders", key, row.last_modified)?;
    let synced_at = timestamp("reminders", key, row.synced_at)?;

    Ok(Reminder {
        external_id: row.external_id,
        list_id: row.list_id,
        title: row.title,
        notes: row.notes,
        due,
        is_completed: row.is_completed,
        completed_at,
        priority: row.priority,
        has_recurrence: row.has_recurrence,
        created_at,
        last_modified,
        synced_at: Some(synced_at),
    })
}
