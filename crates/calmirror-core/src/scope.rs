//! Fetch scoping
//!
//! A snapshot is only authoritative for the part of the source it was
//! fetched from. [`FetchScope`] records that part: a calendar filter plus,
//! for events, a date window. Reconciliation only deletes mirror rows that
//! fall inside it.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::MirrorEntity;

/// Calendar/list filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// Every calendar and list
    #[default]
    All,
    /// Only the listed calendar/list ids
    Calendars(BTreeSet<String>),
}

impl Scope {
    /// Build a scope from an optional id list (`None` = all)
    pub fn from_filter(filter: Option<&[String]>) -> Self {
        match filter {
            None => Scope::All,
            Some(ids) => Scope::Calendars(ids.iter().cloned().collect()),
        }
    }

    /// Whether records of the given calendar/list fall in this scope
    pub fn includes(&self, scope_id: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Calendars(ids) => ids.contains(scope_id),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Scope::All)
    }
}

/// Half-open time window `[start, end)` for event fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window reaching `past_days` back and `future_days` ahead of `now`
    ///
    /// Bounds saturate at the representable date range.
    pub fn around(now: DateTime<Utc>, past_days: u32, future_days: u32) -> Self {
        let start = now
            .checked_sub_signed(Duration::days(i64::from(past_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = now
            .checked_add_signed(Duration::days(i64::from(future_days)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { start, end }
    }

    /// Whether `[start, end]` overlaps the window
    ///
    /// Zero-length spans count when their instant lies inside the window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if start == end {
            return start >= self.start && start < self.end;
        }
        start < self.end && end > self.start
    }
}

/// The exact scope a snapshot was fetched with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchScope {
    pub calendars: Scope,
    pub window: Option<DateWindow>,
}

impl FetchScope {
    /// Unbounded scope: all calendars, no window
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(calendars: Scope, window: Option<DateWindow>) -> Self {
        Self { calendars, window }
    }

    /// Whether a record lies inside this scope
    ///
    /// Kinds without a time span are scoped by calendar only.
    pub fn contains<E: MirrorEntity>(&self, entity: &E) -> bool {
        if !self.calendars.includes(entity.scope_id()) {
            return false;
        }
        match (self.window, entity.time_span()) {
            (Some(window), Some((start, end))) => window.overlaps(start, end),
            _ => true,
        }
    }
}
