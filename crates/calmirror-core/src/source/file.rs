//! JSON export file source
//!
//! Reads calendars, events and reminders from a JSON export of the form
//! `{"calendars": [...], "events": [...], "reminders": [...]}`. Change
//! notices come from polling the file's modification time.
//!
//! A cycle starts with `fetch_calendars`, which pins the export that the
//! cycle's event and reminder fetches then read. The file is only parsed
//! again once its modification time moves.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{CalendarEvent, CalendarInfo, Reminder};
use crate::scope::{FetchScope, Scope};
use crate::source::{ChangeNotice, EventSource, SourceError, SourceResult, NOTICE_CHANNEL_CAPACITY};

/// Default modification-time polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// On-disk export format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceExport {
    #[serde(default)]
    pub calendars: Vec<CalendarInfo>,
    #[serde(default)]
    pub events: Vec<CalendarEvent>,
    #[serde(default)]
    pub reminders: Vec<Reminder>,
}

impl SourceExport {
    /// Write the export as pretty JSON
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Parsed export and the modification time it was read at
struct Loaded {
    modified: Option<SystemTime>,
    export: Arc<SourceExport>,
}

/// Source backed by a JSON export file
pub struct FileSource {
    path: PathBuf,
    poll_interval: Duration,
    notices: broadcast::Sender<ChangeNotice>,
    poller: Mutex<Option<JoinHandle<()>>>,
    pinned: Mutex<Option<Loaded>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            notices,
            poller: Mutex::new(None),
            pinned: Mutex::new(None),
        }
    }

    /// Set how often the file's modification time is checked
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the export if it changed since it was last pinned
    async fn refresh(&self) -> SourceResult<Arc<SourceExport>> {
        let modified = modified_time(&self.path).await.ok();
        let unchanged = self
            .pinned
            .lock()
            .as_ref()
            .filter(|loaded| modified.is_some() && loaded.modified == modified)
            .map(|loaded| Arc::clone(&loaded.export));
        if let Some(export) = unchanged {
            return Ok(export);
        }

        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        let export: SourceExport =
            serde_json::from_slice(&bytes).map_err(|source| SourceError::Decode {
                path: self.path.clone(),
                source,
            })?;
        debug!("Loaded source export {:?}", self.path);

        let export = Arc::new(export);
        *self.pinned.lock() = Some(Loaded {
            modified,
            export: Arc::clone(&export),
        });
        Ok(export)
    }

    /// The export pinned by the last `fetch_calendars`, loading it if none is
    async fn pinned(&self) -> SourceResult<Arc<SourceExport>> {
        let pinned = self.pinned.lock().as_ref().map(|loaded| Arc::clone(&loaded.export));
        match pinned {
            Some(export) => Ok(export),
            None => self.refresh().await,
        }
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let path = self.path.clone();
        let notices = self.notices.clone();
        let period = self.poll_interval;

        tokio::spawn(async move {
            let mut last_seen = modified_time(&path).await.ok();
            let mut missing = false;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if notices.receiver_count() == 0 {
                    debug!("No change subscribers left; stopping poller for {:?}", path);
                    break;
                }

                let current = match modified_time(&path).await {
                    Ok(modified) => {
                        if missing {
                            debug!("Source file {:?} is back", path);
                            missing = false;
                        }
                        Some(modified)
                    }
                    Err(e) => {
                        if !missing {
                            warn!("Cannot stat source file {:?}: {}", path, e);
                            missing = true;
                        }
                        None
                    }
                };
                if current != last_seen {
                    debug!("Source file {:?} changed", path);
                    last_seen = current;
                    if notices.send(ChangeNotice).is_err() {
                        debug!("No change subscribers left for {:?}", path);
                    }
                }
            }
        })
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

async fn modified_time(path: &Path) -> std::io::Result<SystemTime> {
    tokio::fs::metadata(path).await?.modified()
}

#[async_trait]
impl EventSource for FileSource {
    async fn request_access(&self) -> SourceResult<bool> {
        Ok(tokio::fs::metadata(&self.path).await.is_ok())
    }

    async fn fetch_calendars(&self) -> SourceResult<Vec<CalendarInfo>> {
        Ok(self.refresh().await?.calendars.clone())
    }

    async fn fetch_events(&self, scope: &FetchScope) -> SourceResult<Vec<CalendarEvent>> {
        let export = self.pinned().await?;
        Ok(export
            .events
            .iter()
            .filter(|e| scope.contains(*e))
            .cloned()
            .collect())
    }

    async fn fetch_reminders(&self, scope: &Scope) -> SourceResult<Vec<Reminder>> {
        let export = self.pinned().await?;
        Ok(export
            .reminders
            .iter()
            .filter(|r| scope.includes(&r.list_id))
            .cloned()
            .collect())
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<ChangeNotice>> {
        // Subscribe first so a fresh poller never sees zero receivers
        let receiver = self.notices.subscribe();
        let mut poller = self.poller.lock();
        if poller.as_ref().map_or(true, JoinHandle::is_finished) {
            *poller = Some(self.spawn_poller());
        }
        Some(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CalendarKind;
    use chrono::{TimeZone, Utc};

    fn sample() -> SourceExport {
        let start = Utc.with_ymd_and_hms(2024, 11, 4, 15, 0, 0).unwrap();
        SourceExport {
            calendars: vec![
                CalendarInfo::new("work", "Work", CalendarKind::Events),
                CalendarInfo::new("todo", "Todo", CalendarKind::Reminders),
            ],
            events: vec![
                CalendarEvent::new("e1", "work", "Review", start, start + chrono::Duration::hours(1)),
                CalendarEvent::new("e2", "home", "Gym", start, start + chrono::Duration::hours(1)),
            ],
            reminders: vec![Reminder::new("r1", "todo", "Send invoice")],
        }
    }

    #[tokio::test]
    async fn test_reads_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        sample().write_to(&path).unwrap();

        let source = FileSource::new(&path);
        assert!(source.request_access().await.unwrap());
        assert_eq!(source.fetch_calendars().await.unwrap().len(), 2);

        let scope = FetchScope::new(Scope::from_filter(Some(&["work".to_string()])), None);
        let events = source.fetch_events(&scope).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].external_id, "e1");

        assert_eq!(source.fetch_reminders(&Scope::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_denies_access() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(dir.path().join("absent.json"));
        assert!(!source.request_access().await.unwrap());

        let err = source.fetch_calendars().await.unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FileSource::new(&path).fetch_calendars().await.unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_partial_export_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"calendars": []}"#).unwrap();

        let source = FileSource::new(&path);
        assert!(source.fetch_events(&FetchScope::all()).await.unwrap().is_empty());
        assert!(source.fetch_reminders(&Scope::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poller_emits_notice_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        sample().write_to(&path).unwrap();

        let source = FileSource::new(&path).with_poll_interval(Duration::from_millis(20));
        let mut rx = source.subscribe_changes().unwrap();

        // Let the poller record the initial mtime, then rewrite with a later one
        tokio::time::sleep(Duration::from_millis(60)).await;
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
        drop(file);

        let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(notice.unwrap().unwrap(), ChangeNotice);
    }

    #[tokio::test]
    async fn test_poller_stops_without_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(dir.path().join("absent.json"))
            .with_poll_interval(Duration::from_millis(10));

        let rx = source.subscribe_changes().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!source.poller.lock().as_ref().unwrap().is_finished());

        drop(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(source.poller.lock().as_ref().unwrap().is_finished());

        // A new subscriber gets a new poller
        let _rx = source.subscribe_changes().unwrap();
        assert!(!source.poller.lock().as_ref().unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_cycle_reads_one_version_of_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        sample().write_to(&path).unwrap();
        let source = FileSource::new(&path);

        assert_eq!(source.fetch_calendars().await.unwrap().len(), 2);

        // Rewritten mid-cycle with a later modification time
        let mut newer = sample();
        newer.events.clear();
        newer.reminders.clear();
        newer.write_to(&path).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
        drop(file);

        assert_eq!(source.fetch_events(&FetchScope::all()).await.unwrap().len(), 2);
        assert_eq!(source.fetch_reminders(&Scope::All).await.unwrap().len(), 1);

        // The next cycle picks up the new version
        source.fetch_calendars().await.unwrap();
        assert!(source.fetch_events(&FetchScope::all()).await.unwrap().is_empty());
        assert!(source.fetch_reminders(&Scope::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_file_is_not_parsed_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        sample().write_to(&path).unwrap();
        let stamp = SystemTime::now() - Duration::from_secs(60);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(stamp).unwrap();
        drop(file);

        let source = FileSource::new(&path);
        assert_eq!(source.fetch_calendars().await.unwrap().len(), 2);

        std::fs::write(&path, "{ not json").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(stamp).unwrap();
        drop(file);

        assert_eq!(source.fetch_calendars().await.unwrap().len(), 2);
    }
}
