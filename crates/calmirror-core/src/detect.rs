//! Field-level change detection
//!
//! Decides whether an incoming record differs from the mirrored one in any
//! stable field. Volatile fields (`created_at`, `last_modified`) and the
//! mirror's own `synced_at` stamp are never compared.
//!
//! Timestamps are compared at millisecond precision, the precision the
//! mirror stores them at, so sub-millisecond jitter in the source's
//! representation does not count as a change.

use chrono::{DateTime, Utc};

use crate::models::{CalendarEvent, CalendarInfo, Reminder};

/// Truncate a timestamp to the mirror's storage precision
fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn same_instant(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    millis(a) == millis(b)
}

fn same_optional_instant(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    a.map(millis) == b.map(millis)
}

/// Whether a calendar descriptor changed
pub fn calendar_changed(existing: &CalendarInfo, incoming: &CalendarInfo) -> bool {
    existing.title != incoming.title
        || existing.kind != incoming.kind
        || existing.color != incoming.color
        || existing.source_name != incoming.source_name
        || existing.is_writable != incoming.is_writable
}

/// Whether an event changed
pub fn event_changed(existing: &CalendarEvent, incoming: &CalendarEvent) -> bool {
    existing.title != incoming.title
        || existing.calendar_id != incoming.calendar_id
        || existing.notes != incoming.notes
        || existing.location != incoming.location
        || existing.url != incoming.url
        || !same_instant(existing.start, incoming.start)
        || !same_instant(existing.end, incoming.end)
        || existing.is_all_day != incoming.is_all_day
        || existing.status != incoming.status
        || existing.has_recurrence != incoming.has_recurrence
}

/// Whether a reminder changed
pub fn reminder_changed(existing: &Reminder, incoming: &Reminder) -> bool {
    existing.title != incoming.title
        || existing.list_id != incoming.list_id
        || existing.notes != incoming.notes
        || !same_optional_instant(existing.due, incoming.due)
        || existing.is_completed != incoming.is_completed
        || !same_optional_instant(existing.completed_at, incoming.completed_at)
        || existing.priority != incoming.priority
        || existing.has_recurrence != incoming.has_recurrence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CalendarKind, EventStatus};
    use chrono::{Duration, TimeZone};

    fn base_event() -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let mut event = CalendarEvent::new("evt-1", "work", "Planning", start, start + Duration::hours(1));
        event.location = Some("Room 4".to_string());
        event
    }

    #[test]
    fn test_identical_event_unchanged() {
        let a = base_event();
        assert!(!event_changed(&a, &a.clone()));
    }

    #[test]
    fn test_volatile_fields_ignored() {
        let a = base_event();
        let mut b = a.clone();
        b.last_modified = Some(Utc::now());
        b.created_at = Some(Utc::now());
        b.synced_at = Some(Utc::now());
        assert!(!event_changed(&a, &b));
    }

    #[test]
    fn test_each_stable_event_field_detected() {
        let a = base_event();
        let mutations: Vec<Box<dyn Fn(&mut CalendarEvent)>> = vec![
            Box::new(|e: &mut CalendarEvent| e.title = "Other".into()),
            Box::new(|e: &mut CalendarEvent| e.calendar_id = "home".into()),
            Box::new(|e: &mut CalendarEvent| e.notes = Some("agenda".into())),
            Box::new(|e: &mut CalendarEvent| e.location = None),
            Box::new(|e: &mut CalendarEvent| e.url = Some("https://example.com".into())),
            Box::new(|e: &mut CalendarEvent| e.start += Duration::minutes(5)),
            Box::new(|e: &mut CalendarEvent| e.end += Duration::minutes(5)),
            Box::new(|e: &mut CalendarEvent| e.is_all_day = true),
            Box::new(|e: &mut CalendarEvent| e.status = EventStatus::Cancelled),
            Box::new(|e: &mut CalendarEvent| e.has_recurrence = true),
        ];
        for mutate in mutations {
            let mut b = a.clone();
            mutate(&mut b);
            assert!(event_changed(&a, &b), "mutation not detected: {:?}", b);
        }
    }

    #[test]
    fn test_sub_millisecond_jitter_ignored() {
        let a = base_event();
        let mut b = a.clone();
        b.start += Duration::microseconds(400);
        assert!(!event_changed(&a, &b));

        b.start += Duration::milliseconds(1);
        assert!(event_changed(&a, &b));
    }

    #[test]
    fn test_reminder_due_and_completion() {
        let a = Reminder::new("rem-1", "inbox", "Call plumber");
        let mut b = a.clone();
        assert!(!reminder_changed(&a, &b));

        b.due = Some(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        assert!(reminder_changed(&a, &b));

        let mut c = a.clone();
        c.complete(Utc::now());
        assert!(reminder_changed(&a, &c));

        let mut d = a.clone();
        d.priority = 1;
        assert!(reminder_changed(&a, &d));

        let mut e = a.clone();
        e.last_modified = Some(Utc::now());
        assert!(!reminder_changed(&a, &e));
    }

    #[test]
    fn test_calendar_fields() {
        let a = CalendarInfo::new("cal-1", "Work", CalendarKind::Events);
        let mut b = a.clone();
        b.synced_at = Some(Utc::now());
        assert!(!calendar_changed(&a, &b));

        b.color = Some("#ff0000".into());
        assert!(calendar_changed(&a, &b));
    }
}
