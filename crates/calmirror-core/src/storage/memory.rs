//! In-memory mirror store
//!
//! Copy-on-write tables: a transaction works on a clone and swaps it in
//! when the closure succeeds, so a failed batch leaves nothing behind.
//! Carries instrumentation hooks for exercising the sync coordinator:
//! injected failures, artificial latency and concurrency counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::models::{CalendarEvent, CalendarInfo, Reminder};
use crate::scope::FetchScope;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::mirror::{MirrorQuery, MirrorStore, MirrorTransaction, MirrorTx};

#[derive(Debug, Clone, Default)]
struct Tables {
    calendars: BTreeMap<String, CalendarInfo>,
    events: BTreeMap<String, CalendarEvent>,
    reminders: BTreeMap<String, Reminder>,
}

macro_rules! impl_table {
    ($entity:ty, $field:ident) => {
        impl MirrorTx<$entity> for Tables {
            fn get(&self, key: &str) -> StorageResult<Option<$entity>> {
                Ok(self.$field.get(key).cloned())
            }

            fn scan(&self, scope: &FetchScope) -> StorageResult<Vec<$entity>> {
                Ok(self
                    .$field
                    .values()
                    .filter(|row| scope.contains(*row))
                    .cloned()
                    .collect())
            }

            fn upsert(&mut self, entity: &$entity) -> StorageResult<()> {
                let mut row = entity.clone();
                if row.synced_at.is_none() {
                    row.synced_at = Some(Utc::now());
                }
                self.$field.insert(row.external_id.clone(), row);
                Ok(())
            }

            fn delete_keys(&mut self, keys: &[String]) -> StorageResult<usize> {
                let mut deleted = 0;
                for key in keys {
                    if self.$field.remove(key).is_some() {
                        deleted += 1;
                    }
                }
                Ok(deleted)
            }

            fn count(&self) -> StorageResult<usize> {
                Ok(self.$field.len())
            }
        }
    };
}

impl_table!(CalendarInfo, calendars);
impl_table!(CalendarEvent, events);
impl_table!(Reminder, reminders);

/// In-memory mirror with test instrumentation
#[derive(Debug, Default)]
pub struct MemoryMirror {
    tables: RwLock<Tables>,
    /// Serializes writers; readers go through `tables` directly
    write_lock: Mutex<()>,
    latency: Mutex<Duration>,
    fail_next: AtomicUsize,
    committed: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` transactions fail before touching any table
    pub fn fail_next_transactions(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Sleep this long inside every transaction (blocks the calling thread)
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of transactions that committed
    pub fn committed_transactions(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }

    /// Highest number of transactions ever entered at the same time
    pub fn peak_concurrent_transactions(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn run_transaction<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut dyn MirrorTransaction) -> StorageResult<R>,
    {
        let _writer = self.write_lock.lock();

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        if self.take_injected_failure() {
            return Err(StorageError::Unavailable(
                "injected transaction failure".to_string(),
            ));
        }

        let mut working = self.tables.read().clone();
        let value = f(&mut working)?;
        *self.tables.write() = working;
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }
}

impl MirrorStore for MemoryMirror {
    fn transaction<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut dyn MirrorTransaction) -> StorageResult<R>,
    {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now_active, Ordering::SeqCst);

        let result = self.run_transaction(f);

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn read<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&dyn MirrorTransaction) -> StorageResult<R>,
    {
        let tables = self.tables.read();
        f(&*tables)
    }
}

impl MirrorQuery for MemoryMirror {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CalendarKind;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn event(id: &str) -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2024, 8, 1, 9, 0, 0).unwrap();
        CalendarEvent::new(id, "work", id.to_uppercase(), start, start + chrono::Duration::hours(1))
    }

    #[test]
    fn test_commit_and_read() {
        let mirror = MemoryMirror::new();
        mirror
            .transaction(|tx| {
                MirrorTx::<CalendarInfo>::upsert(
                    tx,
                    &CalendarInfo::new("work", "Work", CalendarKind::Events),
                )?;
                MirrorTx::<CalendarEvent>::upsert(tx, &event("a"))
            })
            .unwrap();

        assert_eq!(mirror.count().unwrap(), 2);
        assert_eq!(mirror.committed_transactions(), 1);

        let row = mirror
            .read(|tx| MirrorTx::<CalendarEvent>::get(tx, "a"))
            .unwrap()
            .unwrap();
        assert!(row.synced_at.is_some());
    }

    #[test]
    fn test_error_in_closure_discards_changes() {
        let mirror = MemoryMirror::new();
        mirror
            .transaction(|tx| MirrorTx::<CalendarEvent>::upsert(tx, &event("a")))
            .unwrap();

        let result: StorageResult<()> = mirror.transaction(|tx| {
            MirrorTx::<CalendarEvent>::upsert(tx, &event("b"))?;
            Err(StorageError::Unavailable("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(mirror.counts().unwrap().events, 1);
        assert_eq!(mirror.committed_transactions(), 1);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let mirror = MemoryMirror::new();
        mirror.fail_next_transactions(2);

        for _ in 0..2 {
            let result = mirror.transaction(|tx| MirrorTx::<CalendarEvent>::upsert(tx, &event("a")));
            assert!(matches!(result, Err(StorageError::Unavailable(_))));
        }
        mirror
            .transaction(|tx| MirrorTx::<CalendarEvent>::upsert(tx, &event("a")))
            .unwrap();
        assert_eq!(mirror.count().unwrap(), 1);
    }

    #[test]
    fn test_delete_keys() {
        let mirror = MemoryMirror::new();
        mirror
            .transaction(|tx| {
                MirrorTx::<CalendarEvent>::upsert(tx, &event("a"))?;
                MirrorTx::<CalendarEvent>::upsert(tx, &event("b"))
            })
            .unwrap();

        let deleted = mirror
            .transaction(|tx| {
                MirrorTx::<CalendarEvent>::delete_keys(tx, &["a".to_string(), "zz".to_string()])
            })
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(mirror.count().unwrap(), 1);
    }

    #[test]
    fn test_peak_concurrency_tracking() {
        let mirror = Arc::new(MemoryMirror::new());
        mirror.set_latency(Duration::from_millis(50));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let mirror = Arc::clone(&mirror);
                std::thread::spawn(move || {
                    mirror
                        .transaction(|tx| {
                            MirrorTx::<CalendarEvent>::upsert(tx, &event(&format!("e{i}")))
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mirror.committed_transactions(), 2);
        assert_eq!(mirror.peak_concurrent_transactions(), 2);
    }

    #[test]
    fn test_default_queries() {
        let mirror = MemoryMirror::new();
        let mut lunch = event("lunch");
        lunch.title = "Team lunch".to_string();
        lunch.location = Some("Cafeteria".to_string());
        mirror
            .transaction(|tx| {
                MirrorTx::<CalendarEvent>::upsert(tx, &lunch)?;
                MirrorTx::<CalendarEvent>::upsert(tx, &event("standup"))
            })
            .unwrap();

        assert_eq!(mirror.search_events("cafe").unwrap().len(), 1);
        assert_eq!(mirror.search_events("LUNCH").unwrap().len(), 1);
        assert_eq!(mirror.events_for_calendar("work").unwrap().len(), 2);
        assert!(mirror.events_for_calendar("home").unwrap().is_empty());
    }
}
