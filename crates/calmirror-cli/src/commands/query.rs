//! Mirror query handlers
//!
//! These read the local mirror only; run `calmirror sync` first to refresh it.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};

use calmirror_core::{
    Config, DateWindow, MirrorQuery, ReminderFilter, Scope, SqliteMirror,
};

use crate::output::Output;

/// Days shown by `events` when no end date is given
const DEFAULT_EVENT_DAYS: i64 = 7;

fn open_mirror(config: &Config) -> Result<SqliteMirror> {
    SqliteMirror::open(config).context("Failed to open mirror")
}

/// List mirrored calendars
pub fn calendars(config: &Config, output: &Output) -> Result<()> {
    let mirror = open_mirror(config)?;
    output.print_calendars(&mirror.all_calendars()?);
    Ok(())
}

/// List events, either for one calendar or inside a date range
pub fn events(
    config: &Config,
    from: Option<String>,
    to: Option<String>,
    calendar: Option<String>,
    output: &Output,
) -> Result<()> {
    let mirror = open_mirror(config)?;

    let window = event_window(from.as_deref(), to.as_deref(), Local::now().date_naive())?;
    let events = match calendar {
        Some(id) => {
            let mut events = mirror.events_for_calendar(&id)?;
            events.retain(|e| window.overlaps(e.start, e.end));
            events
        }
        None => mirror.events_in_range(window, &config.sync.scope())?,
    };

    output.print_events(&events);
    Ok(())
}

/// List reminders
pub fn reminders(config: &Config, completed: bool, open: bool, output: &Output) -> Result<()> {
    let filter = match (completed, open) {
        (true, false) => ReminderFilter::Completed,
        (false, true) => ReminderFilter::Open,
        _ => ReminderFilter::All,
    };

    let mirror = open_mirror(config)?;
    output.print_reminders(&mirror.reminders(filter)?);
    Ok(())
}

/// Full-text search over events or reminders
pub fn search(config: &Config, query: String, in_reminders: bool, output: &Output) -> Result<()> {
    if query.trim().is_empty() {
        bail!("Search query cannot be empty");
    }

    let mirror = open_mirror(config)?;
    if in_reminders {
        output.print_reminders(&mirror.search_reminders(&query)?);
    } else {
        let mut events = mirror.search_events(&query)?;
        let scope: Scope = config.sync.scope();
        events.retain(|e| scope.includes(&e.calendar_id));
        output.print_events(&events);
    }
    Ok(())
}

/// Resolve `--from`/`--to` into a window of local days
///
/// `to` is inclusive. Without `from` the window starts today; without `to`
/// it spans a week.
fn event_window(from: Option<&str>, to: Option<&str>, today: NaiveDate) -> Result<DateWindow> {
    let start_day = match from {
        Some(s) => parse_date(s)?,
        None => today,
    };
    let end_day = match to {
        Some(s) => parse_date(s)?,
        None => start_day + Duration::days(DEFAULT_EVENT_DAYS - 1),
    };
    if end_day < start_day {
        bail!("--to ({}) is before --from ({})", end_day, start_day);
    }

    Ok(DateWindow::new(
        local_midnight(start_day)?,
        local_midnight(end_day + Duration::days(1))?,
    ))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))
}

fn local_midnight(day: NaiveDate) -> Result<DateTime<Utc>> {
    let midnight = day.and_hms_opt(0, 0, 0).context("Invalid time of day")?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Midnight does not exist on {} in the local time zone", day))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_default_window_is_a_week() {
        let window = event_window(None, None, day("2024-03-04")).unwrap();
        assert_eq!(window.start, local_midnight(day("2024-03-04")).unwrap());
        assert_eq!(window.end, local_midnight(day("2024-03-11")).unwrap());
    }

    #[test]
    fn test_to_is_inclusive() {
        let window = event_window(Some("2024-03-01"), Some("2024-03-01"), day("2024-01-01")).unwrap();
        assert_eq!(window.end, local_midnight(day("2024-03-02")).unwrap());
    }

    #[test]
    fn test_reversed_range_rejected() {
        assert!(event_window(Some("2024-03-05"), Some("2024-03-01"), day("2024-01-01")).is_err());
    }

    #[test]
    fn test_bad_date_rejected() {
        let err = event_window(Some("03/05/2024"), None, day("2024-01-01")).unwrap_err();
        assert!(err.to_string().contains("YYYY-MM-DD"));
    }
}
