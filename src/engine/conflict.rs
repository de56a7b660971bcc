use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Build the candidate span, rejecting `start >= end` and out-of-range dates.
pub(crate) fn validate_range(
    date: NaiveDate,
    start: TimeOfDay,
    end: TimeOfDay,
) -> Result<Span, EngineError> {
    if date.year() < MIN_VALID_YEAR || date.year() > MAX_VALID_YEAR {
        return Err(EngineError::InvalidRange(format!("date {date} outside bookable years")));
    }
    Span::try_new(start, end)
        .ok_or_else(|| EngineError::InvalidRange(format!("start {start} must be before end {end}")))
}

/// First confirmed reservation on `date` that overlaps `span`, if any.
///
/// Both the availability query and the booking transaction decide through
/// this function, so a resource reported free can always be booked unless
/// someone else commits first.
pub(crate) fn find_conflict(
    rs: &ResourceState,
    date: NaiveDate,
    span: Span,
) -> Option<&Reservation> {
    rs.overlapping(date, span).next()
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    date: NaiveDate,
    span: Span,
) -> Result<(), EngineError> {
    match find_conflict(rs, date, span) {
        Some(existing) => Err(EngineError::Conflict {
            reservation_id: existing.id,
            span: existing.span,
        }),
        None => Ok(()),
    }
}

pub(crate) fn validate_resource(resource: &Resource) -> Result<(), EngineError> {
    if resource.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    if resource.kind.len() > MAX_KIND_LEN {
        return Err(EngineError::LimitExceeded("resource kind too long"));
    }
    if resource.equipment.len() > MAX_EQUIPMENT_ITEMS {
        return Err(EngineError::LimitExceeded("too many equipment items"));
    }
    if resource.equipment.iter().any(|e| e.name.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("equipment name too long"));
    }
    Ok(())
}
