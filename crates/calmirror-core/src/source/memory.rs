//! In-memory source
//!
//! A scriptable stand-in for a platform calendar store. Tests and demos
//! use it to control access answers, inject fetch failures, slow fetches
//! down and push change notices by hand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{CalendarEvent, CalendarInfo, EntityKind, Reminder};
use crate::scope::{FetchScope, Scope};
use crate::source::{ChangeNotice, EventSource, SourceError, SourceResult, NOTICE_CHANNEL_CAPACITY};

/// How the source answers access requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Granted,
    Denied,
    /// Never answers
    Pending,
}

#[derive(Debug, Default)]
struct Records {
    calendars: Vec<CalendarInfo>,
    events: Vec<CalendarEvent>,
    reminders: Vec<Reminder>,
}

/// Scriptable in-memory source
#[derive(Debug)]
pub struct MemorySource {
    records: RwLock<Records>,
    access: Mutex<AccessMode>,
    fetch_delay: Mutex<Duration>,
    failures_left: AtomicUsize,
    failure_retryable: AtomicBool,
    snapshot_fetches: AtomicUsize,
    access_requests: AtomicUsize,
    notices: Option<broadcast::Sender<ChangeNotice>>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    /// An empty source that grants access and supports change notices
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(Records::default()),
            access: Mutex::new(AccessMode::Granted),
            fetch_delay: Mutex::new(Duration::ZERO),
            failures_left: AtomicUsize::new(0),
            failure_retryable: AtomicBool::new(true),
            snapshot_fetches: AtomicUsize::new(0),
            access_requests: AtomicUsize::new(0),
            notices: Some(tx),
        }
    }

    /// A source that cannot push change notices
    pub fn without_notifications() -> Self {
        Self {
            notices: None,
            ..Self::new()
        }
    }

    pub fn set_access(&self, mode: AccessMode) {
        *self.access.lock() = mode;
    }

    pub fn set_calendars(&self, calendars: Vec<CalendarInfo>) {
        self.records.write().calendars = calendars;
    }

    pub fn set_events(&self, events: Vec<CalendarEvent>) {
        self.records.write().events = events;
    }

    pub fn set_reminders(&self, reminders: Vec<Reminder>) {
        self.records.write().reminders = reminders;
    }

    /// Replace an event with the same key, or add it
    pub fn upsert_event(&self, event: CalendarEvent) {
        let mut records = self.records.write();
        match records
            .events
            .iter_mut()
            .find(|e| e.external_id == event.external_id)
        {
            Some(slot) => *slot = event,
            None => records.events.push(event),
        }
    }

    pub fn remove_event(&self, external_id: &str) {
        self.records
            .write()
            .events
            .retain(|e| e.external_id != external_id);
    }

    /// Fail the next `n` snapshot fetches
    pub fn fail_next_fetches(&self, n: usize, retryable: bool) {
        self.failure_retryable.store(retryable, Ordering::SeqCst);
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Delay every snapshot fetch
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    /// Number of snapshots fetched (one per cycle)
    pub fn fetch_count(&self) -> usize {
        self.snapshot_fetches.load(Ordering::SeqCst)
    }

    /// Number of access requests received
    pub fn access_requests(&self) -> usize {
        self.access_requests.load(Ordering::SeqCst)
    }

    /// Push a change notice, returning how many subscribers received it
    pub fn notify_change(&self) -> usize {
        match &self.notices {
            Some(tx) => tx.send(ChangeNotice).unwrap_or(0),
            None => 0,
        }
    }

    fn take_failure(&self) -> Option<SourceError> {
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        consumed.then(|| SourceError::Fetch {
            kind: EntityKind::Calendar,
            message: "injected fetch failure".to_string(),
            retryable: self.failure_retryable.load(Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn request_access(&self) -> SourceResult<bool> {
        self.access_requests.fetch_add(1, Ordering::SeqCst);
        let mode = *self.access.lock();
        match mode {
            AccessMode::Granted => Ok(true),
            AccessMode::Denied => Ok(false),
            AccessMode::Pending => std::future::pending().await,
        }
    }

    async fn fetch_calendars(&self) -> SourceResult<Vec<CalendarInfo>> {
        self.snapshot_fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.take_failure() {
            debug!("MemorySource failing fetch on request");
            return Err(err);
        }
        Ok(self.records.read().calendars.clone())
    }

    async fn fetch_events(&self, scope: &FetchScope) -> SourceResult<Vec<CalendarEvent>> {
        Ok(self
            .records
            .read()
            .events
            .iter()
            .filter(|e| scope.contains(*e))
            .cloned()
            .collect())
    }

    async fn fetch_reminders(&self, scope: &Scope) -> SourceResult<Vec<Reminder>> {
        Ok(self
            .records
            .read()
            .reminders
            .iter()
            .filter(|r| scope.includes(&r.list_id))
            .cloned()
            .collect())
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<ChangeNotice>> {
        self.notices.as_ref().map(broadcast::Sender::subscribe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(id: &str, calendar: &str) -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap();
        CalendarEvent::new(id, calendar, id, start, start + chrono::Duration::hours(1))
    }

    #[tokio::test]
    async fn test_access_modes() {
        let source = MemorySource::new();
        assert!(source.request_access().await.unwrap());

        source.set_access(AccessMode::Denied);
        assert!(!source.request_access().await.unwrap());

        source.set_access(AccessMode::Pending);
        let pending =
            tokio::time::timeout(Duration::from_millis(20), source.request_access()).await;
        assert!(pending.is_err());
        assert_eq!(source.access_requests(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let source = MemorySource::new();
        source.fail_next_fetches(1, false);

        let err = source.fetch_calendars().await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(source.fetch_calendars().await.is_ok());
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_fetch_events_filters_scope() {
        let source = MemorySource::new();
        source.set_events(vec![event("a", "work"), event("b", "home")]);

        let scope = FetchScope::new(Scope::from_filter(Some(&["work".to_string()])), None);
        let events = source.fetch_events(&scope).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].external_id, "a");
    }

    #[tokio::test]
    async fn test_upsert_and_remove_event() {
        let source = MemorySource::new();
        source.upsert_event(event("a", "work"));
        let mut renamed = event("a", "work");
        renamed.title = "Renamed".into();
        source.upsert_event(renamed);

        let events = source.fetch_events(&FetchScope::all()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Renamed");

        source.remove_event("a");
        assert!(source.fetch_events(&FetchScope::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_notices() {
        let source = MemorySource::new();
        assert_eq!(source.notify_change(), 0);

        let mut rx = source.subscribe_changes().unwrap();
        assert_eq!(source.notify_change(), 1);
        assert_eq!(rx.recv().await.unwrap(), ChangeNotice);

        let silent = MemorySource::without_notifications();
        assert!(silent.subscribe_changes().is_none());
        assert_eq!(silent.notify_change(), 0);
    }
}
