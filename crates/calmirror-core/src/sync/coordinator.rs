//! Sync coordinator
//!
//! Decides when the mirror is resynced and runs one cycle at a time.
//!
//! ## Triggers
//!
//! - start: one immediate cycle once access is granted
//! - periodic timer (suspended while paused)
//! - change notices from the source, debounced
//! - `force_sync()`
//! - retry timer after a transient failure
//!
//! Timers never run cycles themselves; they enqueue a request for the
//! session's worker task. A request is only accepted when nothing is
//! queued or running, so at most one cycle is ever in flight.
//!
//! ## Sessions
//!
//! Every `start()` opens a new session with a fresh generation number and
//! `stop()` closes it. A cycle whose session ends before its fetches
//! complete commits nothing. One already committing finishes, since the
//! transaction is atomic, but its status and statistics are dropped.
//!
//! Each cycle runs on its own task. A panic inside it fails the cycle
//! with `Internal` and leaves the worker running.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::models::{CalendarEvent, CalendarInfo, Reminder};
use crate::reconcile::{apply_snapshot, SnapshotResult};
use crate::scope::{DateWindow, FetchScope};
use crate::source::{ChangeNotice, EventSource, SourceSnapshot};
use crate::storage::{MirrorQuery, MirrorStore, ReminderFilter, StorageResult};
use crate::sync::error::SyncError;
use crate::sync::stats::SyncStatistics;
use crate::sync::status::{ErrorCause, ErrorKind, SyncStatus};

/// Callback invoked on every status change
pub type StatusCallback = Box<dyn Fn(&SyncStatus) + Send + Sync + 'static>;

/// What caused a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Initial,
    Periodic,
    Notification,
    Manual,
    Retry,
    Resume,
    /// Replaces a cycle that was blocked by one from a stopped session
    Requeue,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::Initial => "initial",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Notification => "notification",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Retry => "retry",
            SyncTrigger::Resume => "resume",
            SyncTrigger::Requeue => "requeue",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Starting,
    Active,
}

#[derive(Debug)]
struct Lifecycle {
    phase: Phase,
    paused: bool,
    generation: u64,
}

/// Holds the in-flight slot; released on drop, even if the request is
/// dropped unprocessed with a closed queue
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct CycleRequest {
    generation: u64,
    trigger: SyncTrigger,
    _slot: InFlightGuard,
}

#[derive(Default)]
struct Timers {
    periodic: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [
            self.periodic.take(),
            self.debounce.take(),
            self.retry.take(),
            self.listener.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner<P, S> {
    source: Arc<P>,
    store: Arc<S>,
    settings: SyncSettings,

    lifecycle: RwLock<Lifecycle>,
    status: RwLock<SyncStatus>,
    stats: RwLock<SyncStatistics>,
    last_sync: RwLock<Option<DateTime<Utc>>>,

    in_flight: Arc<AtomicBool>,
    retry_count: AtomicU32,

    timers: Mutex<Timers>,
    queue: Mutex<Option<mpsc::UnboundedSender<CycleRequest>>>,

    status_tx: watch::Sender<SyncStatus>,
    callbacks: Arc<RwLock<Vec<StatusCallback>>>,
    callback_tx: mpsc::UnboundedSender<SyncStatus>,
    callback_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncStatus>>>,
}

/// Keeps the mirror in step with a source
///
/// Dropping the coordinator stops it.
pub struct SyncCoordinator<P: EventSource, S: MirrorStore> {
    inner: Arc<Inner<P, S>>,
}

impl<P: EventSource, S: MirrorStore> SyncCoordinator<P, S> {
    /// Create a stopped coordinator
    ///
    /// Fails with `InvalidConfiguration` if `settings` do not validate.
    pub fn new(source: Arc<P>, store: Arc<S>, settings: SyncSettings) -> Result<Self, SyncError> {
        settings.validate()?;

        let (status_tx, _) = watch::channel(SyncStatus::Idle);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();

        let inner = Inner {
            source,
            store,
            settings,
            lifecycle: RwLock::new(Lifecycle {
                phase: Phase::Stopped,
                paused: false,
                generation: 0,
            }),
            status: RwLock::new(SyncStatus::Idle),
            stats: RwLock::new(SyncStatistics::default()),
            last_sync: RwLock::new(None),
            in_flight: Arc::new(AtomicBool::new(false)),
            retry_count: AtomicU32::new(0),
            timers: Mutex::new(Timers::default()),
            queue: Mutex::new(None),
            status_tx,
            callbacks: Arc::new(RwLock::new(Vec::new())),
            callback_tx,
            callback_rx: Mutex::new(Some(callback_rx)),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Request access and, if granted, begin syncing
    ///
    /// Does nothing unless the coordinator is stopped. A request that is
    /// not answered within `permission_timeout_secs` counts as denied.
    /// Denial publishes `Error(PermissionDenied)` and leaves the
    /// coordinator stopped.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.inner.start().await
    }

    /// Stop syncing and return to `Idle`
    ///
    /// Cancels every timer and the notification listener. A running cycle
    /// skips its commit if it is still fetching; either way its outcome is
    /// discarded.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Cancel the periodic timer until `resume()`
    pub fn pause(&self) {
        let mut life = self.inner.lifecycle.write();
        if life.phase != Phase::Active || life.paused {
            return;
        }
        life.paused = true;
        if let Some(periodic) = self.inner.timers.lock().periodic.take() {
            periodic.abort();
        }
        drop(life);
        info!("Periodic sync paused");
    }

    /// Re-arm the periodic timer from now and run one cycle
    pub fn resume(&self) {
        let generation = {
            let mut life = self.inner.lifecycle.write();
            if life.phase != Phase::Active || !life.paused {
                return;
            }
            life.paused = false;
            if self.inner.settings.periodic_sync_enabled {
                let periodic = tokio::spawn(Arc::clone(&self.inner).periodic(life.generation));
                if let Some(previous) = self.inner.timers.lock().periodic.replace(periodic) {
                    previous.abort();
                }
            }
            life.generation
        };
        info!("Periodic sync resumed");
        self.inner.enqueue_or_log(generation, SyncTrigger::Resume);
    }

    /// Run a cycle now
    ///
    /// Fails with `AlreadyInProgress` if a cycle is queued or running and
    /// with `NotRunning` if the coordinator is not active.
    pub fn force_sync(&self) -> Result<(), SyncError> {
        let generation = self.inner.active_generation().ok_or(SyncError::NotRunning)?;
        self.inner.try_enqueue(generation, SyncTrigger::Manual)
    }

    /// Report a change in the source (restarts the debounce timer)
    pub fn notify_changed(&self) {
        if let Some(generation) = self.inner.active_generation() {
            Arc::clone(&self.inner).debounce(generation);
        }
    }

    /// Register a status callback
    ///
    /// Callbacks run one after another on a single task, in the order the
    /// statuses were published.
    pub fn on_status_changed<F>(&self, callback: F)
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push(Box::new(callback));
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.inner.status.read().clone()
    }

    pub fn current_statistics(&self) -> SyncStatistics {
        self.inner.stats.read().clone()
    }

    /// When the last successful cycle finished
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_sync.read()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lifecycle.read().phase == Phase::Active
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lifecycle.read().paused
    }

    /// Consecutive failed attempts of the current cycle
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }
}

impl<P: EventSource, S: MirrorStore + MirrorQuery> SyncCoordinator<P, S> {
    pub fn calendars(&self) -> StorageResult<Vec<CalendarInfo>> {
        self.inner.store.all_calendars()
    }

    /// Mirrored events overlapping `window`, limited to the configured calendars
    pub fn events_in_range(&self, window: DateWindow) -> StorageResult<Vec<CalendarEvent>> {
        self.inner
            .store
            .events_in_range(window, &self.inner.settings.scope())
    }

    pub fn events_for_calendar(&self, calendar_id: &str) -> StorageResult<Vec<CalendarEvent>> {
        self.inner.store.events_for_calendar(calendar_id)
    }

    pub fn search_events(&self, text: &str) -> StorageResult<Vec<CalendarEvent>> {
        self.inner.store.search_events(text)
    }

    pub fn reminders(&self, filter: ReminderFilter) -> StorageResult<Vec<Reminder>> {
        self.inner.store.reminders(filter)
    }

    pub fn search_reminders(&self, text: &str) -> StorageResult<Vec<Reminder>> {
        self.inner.store.search_reminders(text)
    }
}

impl<P: EventSource, S: MirrorStore> Drop for SyncCoordinator<P, S> {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl<P: EventSource, S: MirrorStore> Inner<P, S> {
    async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        let generation = {
            let mut life = self.lifecycle.write();
            if life.phase != Phase::Stopped {
                debug!("start() ignored: coordinator already running");
                return Ok(());
            }
            life.phase = Phase::Starting;
            life.generation += 1;
            life.generation
        };

        self.ensure_dispatcher();
        info!("Starting sync coordinator");

        let wait = self.settings.permission_timeout();
        let denial = match timeout(wait, self.source.request_access()).await {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some("access denied".to_string()),
            Ok(Err(e)) => Some(format!("access request failed: {}", e)),
            Err(_) => Some(format!("no answer to access request within {:?}", wait)),
        };

        let mut life = self.lifecycle.write();
        if life.phase != Phase::Starting || life.generation != generation {
            debug!("Coordinator stopped while waiting for access");
            return Ok(());
        }

        if let Some(reason) = denial {
            life.phase = Phase::Stopped;
            drop(life);
            warn!("Cannot start sync: {}", reason);
            self.publish(SyncStatus::Error(ErrorCause::new(
                ErrorKind::PermissionDenied,
                reason.clone(),
            )));
            return Err(SyncError::PermissionDenied(reason));
        }

        life.phase = Phase::Active;
        life.paused = false;
        // Spawned under the lifecycle lock so a concurrent stop() sees every handle
        self.activate(generation);
        drop(life);

        info!("Sync coordinator active");
        Ok(())
    }

    fn activate(self: &Arc<Self>, generation: u64) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        *self.queue.lock() = Some(queue_tx);
        tokio::spawn(Arc::clone(self).worker(queue_rx));

        let mut timers = self.timers.lock();

        if self.settings.notification_sync_enabled {
            match self.source.subscribe_changes() {
                Some(changes) => {
                    let listener = Arc::clone(self).listen(generation, changes);
                    timers.listener = Some(tokio::spawn(listener));
                }
                None => debug!("Source offers no change notifications"),
            }
        }

        if self.settings.periodic_sync_enabled {
            timers.periodic = Some(tokio::spawn(Arc::clone(self).periodic(generation)));
        }
        drop(timers);

        self.enqueue_or_log(generation, SyncTrigger::Initial);
    }

    fn stop(&self) {
        let was_running = {
            let mut life = self.lifecycle.write();
            let was_running = life.phase != Phase::Stopped;
            if was_running {
                life.phase = Phase::Stopped;
                life.generation += 1;
            }
            life.paused = false;
            was_running
        };

        self.timers.lock().abort_all();
        // Closing the queue ends the worker once its current cycle is done
        self.queue.lock().take();
        self.retry_count.store(0, Ordering::SeqCst);

        if was_running {
            info!("Sync coordinator stopped");
        }
        self.publish(SyncStatus::Idle);
    }

    fn active_generation(&self) -> Option<u64> {
        let life = self.lifecycle.read();
        (life.phase == Phase::Active).then_some(life.generation)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active_generation() == Some(generation)
    }

    /// Queue a cycle if none is queued or running
    fn try_enqueue(&self, generation: u64, trigger: SyncTrigger) -> Result<(), SyncError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyInProgress);
        }

        let request = CycleRequest {
            generation,
            trigger,
            _slot: InFlightGuard(Arc::clone(&self.in_flight)),
        };

        match self.queue.lock().as_ref() {
            // A failed send drops the request and with it the slot
            Some(queue) => queue.send(request).map_err(|_| SyncError::NotRunning),
            None => Err(SyncError::NotRunning),
        }
    }

    fn enqueue_or_log(&self, generation: u64, trigger: SyncTrigger) {
        match self.try_enqueue(generation, trigger) {
            Ok(()) => debug!("Queued {} sync", trigger),
            Err(e) => debug!("Dropped {} sync request: {}", trigger, e),
        }
    }

    /// Restart the debounce timer
    fn debounce(self: Arc<Self>, generation: u64) {
        let delay = self.settings.debounce();
        let inner = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            inner.enqueue_or_log(generation, SyncTrigger::Notification);
        });

        if let Some(previous) = self.timers.lock().debounce.replace(handle) {
            previous.abort();
        }
    }

    fn schedule_retry(self: &Arc<Self>, generation: u64, delay: std::time::Duration) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            inner.enqueue_or_log(generation, SyncTrigger::Retry);
        });

        if let Some(previous) = self.timers.lock().retry.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_retry(&self) {
        if let Some(pending) = self.timers.lock().retry.take() {
            pending.abort();
        }
    }

    async fn listen(
        self: Arc<Self>,
        generation: u64,
        mut changes: broadcast::Receiver<ChangeNotice>,
    ) {
        loop {
            match changes.recv().await {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Change listener lagged by {} notices", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Change notice channel closed");
                    break;
                }
            }
            if !self.is_current(generation) {
                break;
            }
            debug!("Source reported a change");
            Arc::clone(&self).debounce(generation);
        }
    }

    async fn periodic(self: Arc<Self>, generation: u64) {
        let period = self.settings.periodic_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.enqueue_or_log(generation, SyncTrigger::Periodic);
        }
    }

    async fn worker(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<CycleRequest>) {
        while let Some(request) = queue.recv().await {
            if !self.is_current(request.generation) {
                debug!("Skipping {} sync from a stopped session", request.trigger);
                continue;
            }
            self.run_cycle(request).await;
        }
        debug!("Sync worker finished");
    }

    async fn run_cycle(self: &Arc<Self>, request: CycleRequest) {
        let CycleRequest {
            generation,
            trigger,
            _slot: slot,
        } = request;

        self.cancel_retry();
        self.publish_for(generation, SyncStatus::Syncing);
        debug!("Sync cycle started ({})", trigger);

        let started = Instant::now();
        let cycle = tokio::spawn(Arc::clone(self).execute(generation, Utc::now()));
        let outcome = match cycle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(SyncError::Worker(e.to_string())),
        };
        let elapsed = started.elapsed();

        if !self.is_current(generation) {
            debug!("Discarding outcome of a cycle from a stopped session");
            drop(slot);
            if let Some(active) = self.active_generation() {
                self.enqueue_or_log(active, SyncTrigger::Requeue);
            }
            return;
        }

        match outcome {
            Ok((result, total)) => {
                self.retry_count.store(0, Ordering::SeqCst);
                let changes = result.total();
                self.stats.write().record_success(changes, total, elapsed);
                *self.last_sync.write() = Some(Utc::now());
                info!(
                    "Sync cycle ({}) finished in {:?}: {}; {} records mirrored",
                    trigger, elapsed, changes, total
                );
                self.publish_for(generation, SyncStatus::Synced(total));
            }
            Err(err) if err.is_retryable() => {
                let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                let max = self.settings.max_retry_attempts;
                if attempt <= max {
                    let delay = self.settings.retry_delay(attempt);
                    warn!(
                        "Sync cycle failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, max, delay, err
                    );
                    self.schedule_retry(generation, delay);
                } else {
                    error!("Sync cycle failed after {} retries: {}", max, err);
                    self.fail(generation, &err, elapsed);
                }
            }
            Err(err) => {
                error!("Sync cycle failed: {}", err);
                self.fail(generation, &err, elapsed);
            }
        }

        drop(slot);
    }

    fn fail(&self, generation: u64, err: &SyncError, elapsed: std::time::Duration) {
        self.retry_count.store(0, Ordering::SeqCst);
        self.stats.write().record_failure(elapsed);
        self.publish_for(generation, SyncStatus::Error(err.cause()));
    }

    /// Fetch a snapshot and reconcile it; returns the results and the
    /// mirror's row count after commit
    ///
    /// Nothing is committed if the session ended during the fetches.
    async fn execute(
        self: Arc<Self>,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<(SnapshotResult, usize), SyncError> {
        let scope: FetchScope = self.settings.fetch_scope(now);

        let calendars = self.source.fetch_calendars().await?;
        let events = if self.settings.sync_events {
            Some(self.source.fetch_events(&scope).await?)
        } else {
            None
        };
        let reminders = if self.settings.sync_reminders {
            Some(self.source.fetch_reminders(&scope.calendars).await?)
        } else {
            None
        };

        let snapshot = SourceSnapshot {
            calendars,
            events,
            reminders,
        };
        debug!("Fetched {} records from source", snapshot.len());

        if !self.is_current(generation) {
            debug!("Session ended during fetch; skipping commit");
            return Err(SyncError::NotRunning);
        }

        let store = Arc::clone(&self.store);
        let batch_size = self.settings.batch_size;
        let commit = move || -> StorageResult<(SnapshotResult, usize)> {
            let result = apply_snapshot(store.as_ref(), snapshot, &scope, now, batch_size)?;
            let total = store.count()?;
            Ok((result, total))
        };
        let applied = tokio::task::spawn_blocking(commit)
            .await
            .map_err(|e| SyncError::Worker(e.to_string()))?;

        Ok(applied?)
    }

    /// Publish a status on behalf of a session, unless it has ended
    fn publish_for(&self, generation: u64, status: SyncStatus) {
        let life = self.lifecycle.read();
        if life.phase == Phase::Active && life.generation == generation {
            self.publish(status);
        }
    }

    /// Publish a status if it differs from the current one
    fn publish(&self, status: SyncStatus) {
        let mut current = self.status.write();
        if *current == status {
            return;
        }
        debug!("Sync status: {} -> {}", *current, status);
        *current = status.clone();
        self.status_tx.send_replace(status.clone());
        if self.callback_tx.send(status).is_err() {
            debug!("Status dispatcher has shut down");
        }
    }

    /// Start the task that feeds status callbacks
    fn ensure_dispatcher(&self) {
        let Some(mut updates) = self.callback_rx.lock().take() else {
            return;
        };
        let callbacks = Arc::clone(&self.callbacks);
        tokio::spawn(async move {
            while let Some(status) = updates.recv().await {
                for callback in callbacks.read().iter() {
                    callback(&status);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::storage::MemoryMirror;
    use std::time::Duration;

    fn coordinator(
        settings: SyncSettings,
    ) -> Result<SyncCoordinator<MemorySource, MemoryMirror>, SyncError> {
        SyncCoordinator::new(
            Arc::new(MemorySource::new()),
            Arc::new(MemoryMirror::new()),
            settings,
        )
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = SyncSettings {
            debounce_ms: 0,
            ..Default::default()
        };
        let err = coordinator(settings).err().unwrap();
        assert!(matches!(err, SyncError::InvalidConfiguration(ref e) if e.field == "debounce_ms"));
    }

    #[test]
    fn test_new_coordinator_is_idle() {
        let sync = coordinator(SyncSettings::default()).unwrap();
        assert_eq!(sync.current_status(), SyncStatus::Idle);
        assert!(!sync.is_active());
        assert!(!sync.is_paused());
        assert_eq!(sync.retry_count(), 0);
        assert!(sync.last_sync_time().is_none());
        assert_eq!(sync.current_statistics(), SyncStatistics::default());
    }

    #[test]
    fn test_force_sync_requires_start() {
        let sync = coordinator(SyncSettings::default()).unwrap();
        assert!(matches!(sync.force_sync(), Err(SyncError::NotRunning)));
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let sync = coordinator(SyncSettings::default()).unwrap();
        sync.stop();
        sync.stop();
        assert_eq!(sync.current_status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_start_runs_initial_cycle() {
        let sync = coordinator(
            SyncSettings::default()
                .with_periodic_sync(false)
                .with_notification_sync(false),
        )
        .unwrap();
        let mut status = sync.subscribe_status();

        sync.start().await.unwrap();
        assert!(sync.is_active());

        let reached = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| matches!(s, SyncStatus::Synced(_))),
        )
        .await;
        assert!(reached.is_ok());
        assert_eq!(sync.current_statistics().successful_cycles, 1);
        assert!(sync.last_sync_time().is_some());
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(SyncTrigger::Notification.to_string(), "notification");
        assert_eq!(SyncTrigger::Requeue.to_string(), "requeue");
    }
}
