//! Mirror store interface
//!
//! The reconciliation engine talks to the local mirror through these
//! traits so the SQLite store and the in-memory store are interchangeable.
//!
//! - [`MirrorTx`]: per-kind row access inside a transaction
//! - [`MirrorTransaction`]: all kinds at once, what a transaction closure sees
//! - [`MirrorStore`]: transaction boundary, commit on `Ok`, roll back on `Err`
//! - [`MirrorQuery`]: read-only queries served to callers

use crate::models::{CalendarEvent, CalendarInfo, MirrorEntity, Reminder};
use crate::scope::{DateWindow, FetchScope, Scope};
use crate::storage::error::StorageResult;

/// Row access for one record kind
pub trait MirrorTx<E: MirrorEntity> {
    /// Fetch a row by key
    fn get(&self, key: &str) -> StorageResult<Option<E>>;

    /// All rows inside the given scope
    fn scan(&self, scope: &FetchScope) -> StorageResult<Vec<E>>;

    /// Insert or overwrite a row
    fn upsert(&mut self, entity: &E) -> StorageResult<()>;

    /// Delete rows by key, returning how many existed
    fn delete_keys(&mut self, keys: &[String]) -> StorageResult<usize>;

    /// Number of rows of this kind
    fn count(&self) -> StorageResult<usize>;
}

/// Handle passed to transaction closures
pub trait MirrorTransaction:
    MirrorTx<CalendarInfo> + MirrorTx<CalendarEvent> + MirrorTx<Reminder>
{
}

impl<T> MirrorTransaction for T where
    T: MirrorTx<CalendarInfo> + MirrorTx<CalendarEvent> + MirrorTx<Reminder> + ?Sized
{
}

/// Row counts per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MirrorCounts {
    pub calendars: usize,
    pub events: usize,
    pub reminders: usize,
}

impl MirrorCounts {
    pub fn total(&self) -> usize {
        self.calendars + self.events + self.reminders
    }
}

/// Transactional mirror store
///
/// Readers observe either the state before a transaction or the state
/// after it commits, never a partial batch.
pub trait MirrorStore: Send + Sync + 'static {
    /// Run `f` inside one transaction
    fn transaction<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut dyn MirrorTransaction) -> StorageResult<R>;

    /// Run `f` against a consistent read-only view
    fn read<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&dyn MirrorTransaction) -> StorageResult<R>;

    /// Row counts per kind
    fn counts(&self) -> StorageResult<MirrorCounts> {
        self.read(|tx| {
            Ok(MirrorCounts {
                calendars: MirrorTx::<CalendarInfo>::count(tx)?,
                events: MirrorTx::<CalendarEvent>::count(tx)?,
                reminders: MirrorTx::<Reminder>::count(tx)?,
            })
        })
    }

    /// Total rows across every kind
    fn count(&self) -> StorageResult<usize> {
        Ok(self.counts()?.total())
    }
}

/// Which reminders to list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReminderFilter {
    #[default]
    All,
    Open,
    Completed,
}

impl ReminderFilter {
    pub fn matches(&self, reminder: &Reminder) -> bool {
        match self {
            ReminderFilter::All => true,
            ReminderFilter::Open => !reminder.is_completed,
            ReminderFilter::Completed => reminder.is_completed,
        }
    }
}

/// Read-only queries over the mirror
///
/// The defaults scan through [`MirrorStore::read`]; stores with indexes
/// override them.
pub trait MirrorQuery: MirrorStore {
    /// Every calendar and list, ordered by title
    fn all_calendars(&self) -> StorageResult<Vec<CalendarInfo>> {
        let mut calendars = self.read(|tx| MirrorTx::<CalendarInfo>::scan(tx, &FetchScope::all()))?;
        calendars.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(calendars)
    }

    /// Events overlapping `window`, ordered by start
    fn events_in_range(&self, window: DateWindow, scope: &Scope) -> StorageResult<Vec<CalendarEvent>> {
        let fetch = FetchScope::new(scope.clone(), Some(window));
        let mut events = self.read(|tx| MirrorTx::<CalendarEvent>::scan(tx, &fetch))?;
        sort_events(&mut events);
        Ok(events)
    }

    /// Events of one calendar, ordered by start
    fn events_for_calendar(&self, calendar_id: &str) -> StorageResult<Vec<CalendarEvent>> {
        let fetch = FetchScope::new(Scope::Calendars([calendar_id.to_string()].into()), None);
        let mut events = self.read(|tx| MirrorTx::<CalendarEvent>::scan(tx, &fetch))?;
        sort_events(&mut events);
        Ok(events)
    }

    /// Events whose title, notes or location contain `text`
    fn search_events(&self, text: &str) -> StorageResult<Vec<CalendarEvent>> {
        let needle = text.to_lowercase();
        let mut events = self.read(|tx| MirrorTx::<CalendarEvent>::scan(tx, &FetchScope::all()))?;
        events.retain(|e| {
            contains_ci(&e.title, &needle)
                || e.notes.as_deref().is_some_and(|n| contains_ci(n, &needle))
                || e.location.as_deref().is_some_and(|l| contains_ci(l, &needle))
        });
        sort_events(&mut events);
        Ok(events)
    }

    /// Reminders matching `filter`, due date first (undated last)
    fn reminders(&self, filter: ReminderFilter) -> StorageResult<Vec<Reminder>> {
        let mut reminders = self.read(|tx| MirrorTx::<Reminder>::scan(tx, &FetchScope::all()))?;
        reminders.retain(|r| filter.matches(r));
        sort_reminders(&mut reminders);
        Ok(reminders)
    }

    /// Reminders due inside `window`
    fn reminders_due_between(&self, window: DateWindow) -> StorageResult<Vec<Reminder>> {
        let mut reminders = self.read(|tx| MirrorTx::<Reminder>::scan(tx, &FetchScope::all()))?;
        reminders.retain(|r| r.due.is_some_and(|due| due >= window.start && due < window.end));
        sort_reminders(&mut reminders);
        Ok(reminders)
    }

    /// Reminders whose title or notes contain `text`
    fn search_reminders(&self, text: &str) -> StorageResult<Vec<Reminder>> {
        let needle = text.to_lowercase();
        let mut reminders = self.read(|tx| MirrorTx::<Reminder>::scan(tx, &FetchScope::all()))?;
        reminders.retain(|r| {
            contains_ci(&r.title, &needle)
                || r.notes.as_deref().is_some_and(|n| contains_ci(n, &needle))
        });
        sort_reminders(&mut reminders);
        Ok(reminders)
    }
}

fn contains_ci(haystack: &str, lowered_needle: &str) -> bool {
    haystack.to_lowercase().contains(lowered_needle)
}

pub(crate) fn sort_events(events: &mut [CalendarEvent]) {
    events.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| a.external_id.cmp(&b.external_id))
    });
}

pub(crate) fn sort_reminders(reminders: &mut [Reminder]) {
    reminders.sort_by(|a, b| match (a.due, b.due) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.title.cmp(&b.title)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.title.cmp(&b.title),
    });
}
