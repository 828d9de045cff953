//! Reconciliation engine
//!
//! Computes and applies the minimal set of inserts, updates and deletes
//! that makes the mirror match a fresh snapshot from the source.
//!
//! For each record kind:
//! 1. incoming records outside the fetch scope are dropped, and duplicate
//!    keys keep their first occurrence
//! 2. new keys are inserted, changed rows overwritten, unchanged rows left
//!    alone (their `synced_at` is not touched)
//! 3. mirror rows inside the fetch scope whose key is missing from the
//!    snapshot are deleted, in chunks of `batch_size`
//!
//! [`apply_snapshot`] runs every kind inside one store transaction, so a
//! storage error leaves the mirror exactly as it was.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{CalendarEvent, CalendarInfo, MirrorEntity, Reminder};
use crate::scope::FetchScope;
use crate::source::SourceSnapshot;
use crate::storage::{MirrorStore, MirrorTx, StorageResult};

/// Outcome of reconciling one record kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Duplicate or out-of-scope records dropped before diffing
    pub discarded: usize,
}

impl SyncResult {
    /// Rows written or removed
    pub fn total_changes(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }
}

impl std::ops::Add for SyncResult {
    type Output = SyncResult;

    fn add(self, other: SyncResult) -> SyncResult {
        SyncResult {
            inserted: self.inserted + other.inserted,
            updated: self.updated + other.updated,
            deleted: self.deleted + other.deleted,
            discarded: self.discarded + other.discarded,
        }
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} inserted, {} updated, {} deleted",
            self.inserted, self.updated, self.deleted
        )?;
        if self.discarded > 0 {
            write!(f, " ({} discarded)", self.discarded)?;
        }
        Ok(())
    }
}

/// Per-kind results of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub calendars: SyncResult,
    pub events: SyncResult,
    pub reminders: SyncResult,
}

impl SnapshotResult {
    /// Sum over every kind
    pub fn total(&self) -> SyncResult {
        self.calendars + self.events + self.reminders
    }
}

/// Reconcile one record kind against the mirror
///
/// `now` stamps inserted rows; updated rows get `max(now, previous stamp)`
/// so `synced_at` never moves backwards for a key.
pub fn reconcile<E, T>(
    tx: &mut T,
    fresh: Vec<E>,
    scope: &FetchScope,
    now: DateTime<Utc>,
    batch_size: usize,
) -> StorageResult<SyncResult>
where
    E: MirrorEntity,
    T: MirrorTx<E> + ?Sized,
{
    let mut result = SyncResult::default();
    let mut fresh_keys: HashSet<String> = HashSet::with_capacity(fresh.len());
    let mut incoming = Vec::with_capacity(fresh.len());
    let mut duplicates = 0;

    for record in fresh {
        if !scope.contains(&record) {
            result.discarded += 1;
            continue;
        }
        if !fresh_keys.insert(record.external_id().to_string()) {
            duplicates += 1;
            result.discarded += 1;
            continue;
        }
        incoming.push(record);
    }

    if duplicates > 0 {
        warn!(
            "Discarded {} duplicate {} record(s) from source snapshot",
            duplicates,
            E::KIND
        );
    }
    if result.discarded > duplicates {
        debug!(
            "Ignored {} out-of-scope {} record(s)",
            result.discarded - duplicates,
            E::KIND
        );
    }

    let existing: HashMap<String, E> = tx
        .scan(scope)?
        .into_iter()
        .map(|row| (row.external_id().to_string(), row))
        .collect();

    for mut record in incoming {
        // A row may exist outside the scope (e.g. moved into the window)
        let fallback: Option<E>;
        let previous = match existing.get(record.external_id()) {
            Some(row) => Some(row),
            None => {
                fallback = tx.get(record.external_id())?;
                fallback.as_ref()
            }
        };

        match previous {
            None => {
                record.stamp_synced(now);
                tx.upsert(&record)?;
                result.inserted += 1;
            }
            Some(row) if row.has_changed(&record) => {
                let stamp = row.synced_at().map_or(now, |prev| prev.max(now));
                record.stamp_synced(stamp);
                tx.upsert(&record)?;
                result.updated += 1;
            }
            Some(_) => {}
        }
    }

    let mut stale: Vec<String> = existing
        .into_keys()
        .filter(|key| !fresh_keys.contains(key))
        .collect();
    stale.sort();

    for chunk in stale.chunks(batch_size.max(1)) {
        result.deleted += tx.delete_keys(chunk)?;
    }

    debug!("Reconciled {}: {}", E::KIND, result);
    Ok(result)
}

/// Reconcile a full snapshot inside one store transaction
///
/// Kinds missing from the snapshot (`None`) are left untouched.
/// Calendars and reminders are scoped by the calendar filter only; events
/// also by the date window.
pub fn apply_snapshot<S: MirrorStore>(
    store: &S,
    snapshot: SourceSnapshot,
    scope: &FetchScope,
    now: DateTime<Utc>,
    batch_size: usize,
) -> StorageResult<SnapshotResult> {
    let unwindowed = FetchScope::new(scope.calendars.clone(), None);
    let SourceSnapshot {
        calendars,
        events,
        reminders,
    } = snapshot;

    store.transaction(|tx| {
        let mut result = SnapshotResult {
            calendars: reconcile::<CalendarInfo, _>(tx, calendars, &unwindowed, now, batch_size)?,
            ..SnapshotResult::default()
        };
        if let Some(events) = events {
            result.events = reconcile::<CalendarEvent, _>(tx, events, scope, now, batch_size)?;
        }
        if let Some(reminders) = reminders {
            result.reminders = reconcile::<Reminder, _>(tx, reminders, &unwindowed, now, batch_size)?;
        }
        Ok(result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CalendarKind;
    use crate::scope::{DateWindow, Scope};
    use crate::storage::{MemoryMirror, MirrorQuery, StorageError};
    use chrono::{Duration, TimeZone};

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, day, 12, 0, 0).unwrap()
    }

    fn ev(id: &str, calendar: &str, day: u32) -> CalendarEvent {
        CalendarEvent::new(id, calendar, format!("Event {id}"), t(day), t(day) + Duration::hours(1))
    }

    fn events_only(events: Vec<CalendarEvent>) -> SourceSnapshot {
        SourceSnapshot {
            calendars: Vec::new(),
            events: Some(events),
            reminders: None,
        }
    }

    fn run(mirror: &MemoryMirror, events: Vec<CalendarEvent>, scope: &FetchScope, now: DateTime<Utc>) -> SyncResult {
        apply_snapshot(mirror, events_only(events), scope, now, 500)
            .unwrap()
            .events
    }

    fn stored(mirror: &MemoryMirror, id: &str) -> Option<CalendarEvent> {
        mirror
            .read(|tx| MirrorTx::<CalendarEvent>::get(tx, id))
            .unwrap()
    }

    #[test]
    fn test_initial_insert() {
        let mirror = MemoryMirror::new();
        let result = run(&mirror, vec![ev("a", "w", 1), ev("b", "w", 2)], &FetchScope::all(), t(1));
        assert_eq!(result, SyncResult { inserted: 2, ..Default::default() });
        assert_eq!(stored(&mirror, "a").unwrap().synced_at, Some(t(1)));
    }

    #[test]
    fn test_second_pass_is_noop_and_keeps_stamp() {
        let mirror = MemoryMirror::new();
        let snapshot = vec![ev("a", "w", 1), ev("b", "w", 2)];
        run(&mirror, snapshot.clone(), &FetchScope::all(), t(1));

        let mut volatile = snapshot.clone();
        volatile[0].last_modified = Some(t(5));
        let result = run(&mirror, volatile, &FetchScope::all(), t(3));

        assert_eq!(result.total_changes(), 0);
        assert_eq!(stored(&mirror, "a").unwrap().synced_at, Some(t(1)));
    }

    #[test]
    fn test_update_insert_delete_mix() {
        let mirror = MemoryMirror::new();
        run(&mirror, vec![ev("a", "w", 1), ev("b", "w", 2)], &FetchScope::all(), t(1));

        let mut b = ev("b", "w", 2);
        b.title = "Renamed".to_string();
        let result = run(&mirror, vec![b, ev("c", "w", 3)], &FetchScope::all(), t(2));

        assert_eq!(
            result,
            SyncResult { inserted: 1, updated: 1, deleted: 1, discarded: 0 }
        );
        assert!(stored(&mirror, "a").is_none());
        let b = stored(&mirror, "b").unwrap();
        assert_eq!(b.title, "Renamed");
        assert_eq!(b.synced_at, Some(t(2)));
    }

    #[test]
    fn test_synced_at_never_moves_backwards() {
        let mirror = MemoryMirror::new();
        run(&mirror, vec![ev("a", "w", 1)], &FetchScope::all(), t(10));

        let mut changed = ev("a", "w", 1);
        changed.title = "Changed".to_string();
        // Clock went backwards between cycles
        run(&mirror, vec![changed], &FetchScope::all(), t(4));

        assert_eq!(stored(&mirror, "a").unwrap().synced_at, Some(t(10)));
    }

    #[test]
    fn test_duplicates_keep_first() {
        let mirror = MemoryMirror::new();
        let mut second = ev("a", "w", 1);
        second.title = "Second copy".to_string();
        let result = run(&mirror, vec![ev("a", "w", 1), second], &FetchScope::all(), t(1));

        assert_eq!(result.inserted, 1);
        assert_eq!(result.discarded, 1);
        assert_eq!(stored(&mirror, "a").unwrap().title, "Event a");
    }

    #[test]
    fn test_empty_snapshot_clears_scope() {
        let mirror = MemoryMirror::new();
        run(&mirror, vec![ev("a", "w", 1), ev("b", "w", 2)], &FetchScope::all(), t(1));
        let result = run(&mirror, Vec::new(), &FetchScope::all(), t(2));
        assert_eq!(result.deleted, 2);
        assert_eq!(mirror.count().unwrap(), 0);
    }

    #[test]
    fn test_deletes_limited_to_scope() {
        let mirror = MemoryMirror::new();
        run(
            &mirror,
            vec![ev("w1", "work", 5), ev("h1", "home", 5), ev("old", "work", 1)],
            &FetchScope::all(),
            t(1),
        );

        let scope = FetchScope::new(
            Scope::from_filter(Some(&["work".to_string()])),
            Some(DateWindow::new(t(4), t(20))),
        );
        let result = run(&mirror, Vec::new(), &scope, t(2));

        assert_eq!(result.deleted, 1);
        assert!(stored(&mirror, "w1").is_none());
        assert!(stored(&mirror, "h1").is_some(), "other calendar untouched");
        assert!(stored(&mirror, "old").is_some(), "outside window untouched");
    }

    #[test]
    fn test_out_of_scope_incoming_discarded() {
        let mirror = MemoryMirror::new();
        let scope = FetchScope::new(Scope::from_filter(Some(&["work".to_string()])), None);
        let result = run(&mirror, vec![ev("w", "work", 1), ev("h", "home", 1)], &scope, t(1));
        assert_eq!(result.inserted, 1);
        assert_eq!(result.discarded, 1);
        assert!(stored(&mirror, "h").is_none());
    }

    #[test]
    fn test_row_moving_into_scope_counts_as_update() {
        let mirror = MemoryMirror::new();
        run(&mirror, vec![ev("a", "home", 1)], &FetchScope::all(), t(1));

        let scope = FetchScope::new(Scope::from_filter(Some(&["work".to_string()])), None);
        let result = run(&mirror, vec![ev("a", "work", 1)], &scope, t(2));
        assert_eq!(result, SyncResult { updated: 1, ..Default::default() });
        assert_eq!(mirror.counts().unwrap().events, 1);
    }

    #[test]
    fn test_chunked_deletes() {
        let mirror = MemoryMirror::new();
        let many: Vec<_> = (0..7).map(|i| ev(&format!("e{i}"), "w", 1)).collect();
        apply_snapshot(&mirror, events_only(many), &FetchScope::all(), t(1), 3).unwrap();

        let result = apply_snapshot(&mirror, events_only(Vec::new()), &FetchScope::all(), t(2), 3)
            .unwrap();
        assert_eq!(result.events.deleted, 7);
    }

    #[test]
    fn test_snapshot_is_atomic() {
        let mirror = MemoryMirror::new();
        run(&mirror, vec![ev("a", "w", 1)], &FetchScope::all(), t(1));

        mirror.fail_next_transactions(1);
        let err = apply_snapshot(&mirror, events_only(Vec::new()), &FetchScope::all(), t(2), 500);
        assert!(matches!(err, Err(StorageError::Unavailable(_))));
        assert!(stored(&mirror, "a").is_some());
    }

    #[test]
    fn test_all_kinds_in_one_transaction() {
        let mirror = MemoryMirror::new();
        let snapshot = SourceSnapshot {
            calendars: vec![CalendarInfo::new("w", "Work", CalendarKind::Events)],
            events: Some(vec![ev("a", "w", 1)]),
            reminders: Some(vec![Reminder::new("r", "inbox", "Call back")]),
        };
        let result = apply_snapshot(&mirror, snapshot, &FetchScope::all(), t(1), 500).unwrap();

        assert_eq!(result.total().inserted, 3);
        assert_eq!(mirror.committed_transactions(), 1);
        assert_eq!(mirror.all_calendars().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_kind_left_untouched() {
        let mirror = MemoryMirror::new();
        let snapshot = SourceSnapshot {
            calendars: Vec::new(),
            events: Some(vec![ev("a", "w", 1)]),
            reminders: Some(vec![Reminder::new("r", "inbox", "Keep me")]),
        };
        apply_snapshot(&mirror, snapshot, &FetchScope::all(), t(1), 500).unwrap();

        let without_reminders = SourceSnapshot {
            calendars: Vec::new(),
            events: Some(Vec::new()),
            reminders: None,
        };
        let result = apply_snapshot(&mirror, without_reminders, &FetchScope::all(), t(2), 500).unwrap();
        assert_eq!(result.events.deleted, 1);
        assert_eq!(result.reminders, SyncResult::default());
        assert_eq!(mirror.counts().unwrap().reminders, 1);
    }

    #[test]
    fn test_display() {
        let result = SyncResult { inserted: 1, updated: 2, deleted: 3, discarded: 0 };
        assert_eq!(result.to_string(), "1 inserted, 2 updated, 3 deleted");
        let result = SyncResult { discarded: 4, ..result };
        assert!(result.to_string().ends_with("(4 discarded)"));
    }
}
