use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes in one calendar day. `24:00` is a valid end-of-day bound.
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Wall-clock time of day at minute granularity, in the hospital's local time.
///
/// Stored as minutes since midnight, `0..=1440`. Dates and times are never
/// compared as strings; everything goes through this type and `NaiveDate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(MINUTES_PER_DAY);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour.checked_mul(60)?.checked_add(minute)?)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    pub fn minute(self) -> u16 {
        self.0 % 60
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    /// Accepts `HH:MM` and `HH:MM:SS` (seconds must be `00`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.split(':');
        let (Some(h), Some(m)) = (parts.next(), parts.next()) else {
            return Err(format!("bad time of day: {s:?} (expected HH:MM)"));
        };
        let seconds = parts.next();
        if parts.next().is_some() {
            return Err(format!("bad time of day: {s:?}"));
        }
        if h.len() != 2 || m.len() != 2 {
            return Err(format!("bad time of day: {s:?} (expected HH:MM)"));
        }
        let hour: u16 = h.parse().map_err(|_| format!("bad hour in {s:?}"))?;
        let minute: u16 = m.parse().map_err(|_| format!("bad minute in {s:?}"))?;
        if let Some(sec) = seconds
            && sec != "00"
        {
            return Err(format!("{s:?}: only whole minutes are supported"));
        }
        TimeOfDay::from_hm(hour, minute).ok_or_else(|| format!("time of day out of range: {s:?}"))
    }
}

/// Parse a calendar day in ISO `YYYY-MM-DD` form.
pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("bad date {s:?}: {e}"))
}

/// Half-open interval `[start, end)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Span {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: TimeOfDay, end: TimeOfDay) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn whole_day() -> Self {
        Self::new(TimeOfDay::MIDNIGHT, TimeOfDay::END_OF_DAY)
    }

    /// The one overlap rule: `[s1, e1)` and `[s2, e2)` overlap iff `s1 < e2 && s2 < e1`.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub name: String,
    pub quantity: u32,
}

/// A bookable room or operating block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    /// Free-text category, e.g. "consultation" or "operating".
    pub kind: String,
    pub capacity: u32,
    pub equipment: Vec<Equipment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub motif: Option<String>,
    /// Opaque identity of the authenticated actor that booked.
    pub created_by: String,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
}

/// Filter applied on top of the free/busy check in availability queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityFilter {
    pub kind: Option<String>,
    pub min_capacity: Option<u32>,
}

impl AvailabilityFilter {
    pub fn matches(&self, resource: &Resource) -> bool {
        self.kind.as_ref().is_none_or(|k| resource.kind.eq_ignore_ascii_case(k))
            && self.min_capacity.is_none_or(|c| resource.capacity >= c)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// Set once the resource is removed, so writers that raced the removal
    /// and were waiting on the lock see it as gone.
    pub retired: bool,
    /// Confirmed reservations per day, each day sorted by `span.start`.
    pub days: BTreeMap<NaiveDate, Vec<Reservation>>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            retired: false,
            days: BTreeMap::new(),
        }
    }

    /// Confirmed reservations on `date`, ascending by start.
    pub fn reservations_on(&self, date: NaiveDate) -> &[Reservation] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn reservation_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let day = self.days.entry(reservation.date).or_default();
        let pos = day
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, reservation);
    }

    /// Remove reservation by id from `date`. Empty days are dropped.
    pub fn remove_reservation(&mut self, date: NaiveDate, id: Ulid) -> Option<Reservation> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|r| r.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(removed)
    }

    /// Return only reservations on `date` whose span overlaps `query`.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: Span) -> impl Iterator<Item = &Reservation> {
        let day = self.reservations_on(date);
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = day.partition_point(|r| r.span.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |r| r.span.overlaps(&query))
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered { resource: Resource },
    ResourceUpdated { resource: Resource },
    ResourceRemoved { id: Ulid },
    ReservationConfirmed { reservation: Reservation },
    /// Carries the full record (status = cancelled) so the tombstone survives
    /// compaction and replay even after its resource is gone.
    ReservationCancelled { reservation: Reservation },
}
