//! Data models for calmirror
//!
//! Defines the mirrored record kinds: calendar/list descriptors, calendar
//! events and reminders. Every kind carries the stable `external_id` the
//! source assigned to it plus a `synced_at` stamp owned by the
//! reconciliation engine.
//!
//! Fields fall in two groups:
//! - stable fields, compared by the change detector
//! - volatile fields (`created_at`, `last_modified`), maintained by the
//!   source and ignored when deciding whether a row needs rewriting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect;

/// The kinds of records the mirror holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Calendar,
    Event,
    Reminder,
}

impl EntityKind {
    /// Name used in logs and table names
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Calendar => "calendar",
            EntityKind::Event => "event",
            EntityKind::Reminder => "reminder",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract shared by every mirrored record kind
pub trait MirrorEntity: Clone + Send + Sync + 'static {
    /// Which kind of record this is
    const KIND: EntityKind;

    /// Stable identifier assigned by the source (mirror primary key)
    fn external_id(&self) -> &str;

    /// Calendar or list this record belongs to
    ///
    /// Descriptors return their own id so a calendar filter applies to
    /// them as well.
    fn scope_id(&self) -> &str;

    /// Time span used for window scoping, if the kind is windowed
    fn time_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        None
    }

    /// When this record was last written to the mirror
    fn synced_at(&self) -> Option<DateTime<Utc>>;

    /// Stamp the mirror write time
    fn stamp_synced(&mut self, at: DateTime<Utc>);

    /// Whether `incoming` differs from `self` in any stable field
    fn has_changed(&self, incoming: &Self) -> bool;
}

/// What a calendar/list holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarKind {
    Events,
    Reminders,
}

impl CalendarKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarKind::Events => "events",
            CalendarKind::Reminders => "reminders",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "events" => Some(CalendarKind::Events),
            "reminders" => Some(CalendarKind::Reminders),
            _ => None,
        }
    }
}

/// A calendar or reminder list descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalendarInfo {
    /// Source identifier
    pub external_id: String,
    /// Display title
    pub title: String,
    /// Whether this is an event calendar or a reminder list
    pub kind: CalendarKind,
    /// Display color as a hex string
    #[serde(default)]
    pub color: Option<String>,
    /// Account or source the calendar lives in (e.g. "iCloud")
    #[serde(default)]
    pub source_name: String,
    /// Whether the source allows writes to this calendar
    #[serde(default)]
    pub is_writable: bool,
    /// Last mirror write (set by reconciliation)
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl CalendarInfo {
    /// Create a descriptor with the given id and title
    pub fn new(external_id: impl Into<String>, title: impl Into<String>, kind: CalendarKind) -> Self {
        Self {
            external_id: external_id.into(),
            title: title.into(),
            kind,
            color: None,
            source_name: String::new(),
            is_writable: true,
            synced_at: None,
        }
    }
}

impl MirrorEntity for CalendarInfo {
    const KIND: EntityKind = EntityKind::Calendar;

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn scope_id(&self) -> &str {
        &self.external_id
    }

    fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    fn stamp_synced(&mut self, at: DateTime<Utc>) {
        self.synced_at = Some(at);
    }

    fn has_changed(&self, incoming: &Self) -> bool {
        detect::calendar_changed(self, incoming)
    }
}

/// Participation/booking status of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    None,
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::None => "none",
            EventStatus::Confirmed => "confirmed",
            EventStatus::Tentative => "tentative",
            EventStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a stored status, falling back to `None` for unknown values
    pub fn parse(s: &str) -> Self {
        match s {
            "confirmed" => EventStatus::Confirmed,
            "tentative" => EventStatus::Tentative,
            "cancelled" => EventStatus::Cancelled,
            _ => EventStatus::None,
        }
    }
}

/// A calendar event as mirrored from the source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalendarEvent {
    /// Source identifier
    pub external_id: String,
    /// Calendar this event belongs to
    pub calendar_id: String,
    /// Event title
    pub title: String,
    /// Free-form notes
    #[serde(default)]
    pub notes: Option<String>,
    /// Location text
    #[serde(default)]
    pub location: Option<String>,
    /// Attached URL
    #[serde(default)]
    pub url: Option<String>,
    /// Start time
    pub start: DateTime<Utc>,
    /// End time
    pub end: DateTime<Utc>,
    /// Whether the event spans whole days
    #[serde(default)]
    pub is_all_day: bool,
    /// Booking status
    #[serde(default)]
    pub status: EventStatus,
    /// Whether the event has recurrence rules
    #[serde(default)]
    pub has_recurrence: bool,
    /// Creation time reported by the source (volatile)
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Modification time reported by the source (volatile)
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    /// Last mirror write (set by reconciliation)
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl CalendarEvent {
    /// Create an event with the required fields
    pub fn new(
        external_id: impl Into<String>,
        calendar_id: impl Into<String>,
        title: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            calendar_id: calendar_id.into(),
            title: title.into(),
            notes: None,
            location: None,
            url: None,
            start,
            end,
            is_all_day: false,
            status: EventStatus::None,
            has_recurrence: false,
            created_at: None,
            last_modified: None,
            synced_at: None,
        }
    }

    /// Duration of the event
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

impl MirrorEntity for CalendarEvent {
    const KIND: EntityKind = EntityKind::Event;

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn scope_id(&self) -> &str {
        &self.calendar_id
    }

    fn time_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.start, self.end))
    }

    fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    fn stamp_synced(&mut self, at: DateTime<Utc>) {
        self.synced_at = Some(at);
    }

    fn has_changed(&self, incoming: &Self) -> bool {
        detect::event_changed(self, incoming)
    }
}

/// A reminder (to-do item) as mirrored from the source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reminder {
    /// Source identifier
    pub external_id: String,
    /// Reminder list this item belongs to
    pub list_id: String,
    /// Reminder title
    pub title: String,
    /// Free-form notes
    #[serde(default)]
    pub notes: Option<String>,
    /// Due date, if any
    #[serde(default)]
    pub due: Option<DateTime<Utc>>,
    /// Completion flag
    #[serde(default)]
    pub is_completed: bool,
    /// When the reminder was completed
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Priority: 0 = none, 1 = highest .. 9 = lowest
    #[serde(default)]
    pub priority: u8,
    /// Whether the reminder repeats
    #[serde(default)]
    pub has_recurrence: bool,
    /// Creation time reported by the source (volatile)
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Modification time reported by the source (volatile)
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    /// Last mirror write (set by reconciliation)
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Reminder {
    /// Create an open reminder with the given title
    pub fn new(
        external_id: impl Into<String>,
        list_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            list_id: list_id.into(),
            title: title.into(),
            notes: None,
            due: None,
            is_completed: false,
            completed_at: None,
            priority: 0,
            has_recurrence: false,
            created_at: None,
            last_modified: None,
            synced_at: None,
        }
    }

    /// Mark the reminder completed at the given time
    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.is_completed = true;
        self.completed_at = Some(at);
    }

    /// Whether the reminder is open and past its due date
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_completed && self.due.is_some_and(|due| due < now)
    }
}

impl MirrorEntity for Reminder {
    const KIND: EntityKind = EntityKind::Reminder;

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn scope_id(&self) -> &str {
        &self.list_id
    }

    fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    fn stamp_synced(&mut self, at: DateTime<Utc>) {
        self.synced_at = Some(at);
    }

    fn has_changed(&self, incoming: &Self) -> bool {
        detect::reminder_changed(self, incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_event_new() {
        let event = CalendarEvent::new("evt-1", "work", "Standup", at(9), at(10));
        assert_eq!(event.external_id(), "evt-1");
        assert_eq!(event.scope_id(), "work");
        assert_eq!(event.status, EventStatus::None);
        assert!(event.synced_at.is_none());
        assert_eq!(event.duration(), chrono::Duration::hours(1));
        assert_eq!(event.time_span(), Some((at(9), at(10))));
    }

    #[test]
    fn test_reminder_complete() {
        let mut reminder = Reminder::new("rem-1", "inbox", "Buy milk");
        assert!(!reminder.is_completed);
        reminder.complete(at(12));
        assert!(reminder.is_completed);
        assert_eq!(reminder.completed_at, Some(at(12)));
        assert!(reminder.time_span().is_none());
    }

    #[test]
    fn test_reminder_overdue() {
        let mut reminder = Reminder::new("rem-1", "inbox", "File taxes");
        assert!(!reminder.is_overdue(at(12)));

        reminder.due = Some(at(8));
        assert!(reminder.is_overdue(at(12)));
        assert!(!reminder.is_overdue(at(7)));

        reminder.complete(at(9));
        assert!(!reminder.is_overdue(at(12)));
    }

    #[test]
    fn test_calendar_scope_is_own_id() {
        let calendar = CalendarInfo::new("cal-1", "Work", CalendarKind::Events);
        assert_eq!(calendar.scope_id(), "cal-1");
        assert_eq!(CalendarInfo::KIND, EntityKind::Calendar);
    }

    #[test]
    fn test_stamp_synced() {
        let mut event = CalendarEvent::new("evt-1", "work", "Standup", at(9), at(10));
        event.stamp_synced(at(11));
        assert_eq!(event.synced_at(), Some(at(11)));
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            EventStatus::None,
            EventStatus::Confirmed,
            EventStatus::Tentative,
            EventStatus::Cancelled,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), status);
        }
        assert_eq!(EventStatus::parse("bogus"), EventStatus::None);
    }

    #[test]
    fn test_event_deserializes_with_defaults() {
        let json = r#"{
            "external_id": "evt-9",
            "calendar_id": "home",
            "title": "Dinner",
            "start": "2024-03-01T18:00:00Z",
            "end": "2024-03-01T20:00:00Z"
        }"#;
        let event: CalendarEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.title, "Dinner");
        assert!(!event.is_all_day);
        assert!(event.synced_at.is_none());
        assert_eq!(event.status, EventStatus::None);
    }
}
