use std::time::Instant;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::observability::AVAILABILITY_DURATION_SECONDS;

use super::conflict::{find_conflict, validate_range};
use super::{Engine, EngineError};

impl Engine {
    /// Resources with no confirmed reservation overlapping `[start, end)` on `date`.
    ///
    /// Point-in-time and advisory: each resource is read under its own read
    /// lock, nothing is held afterwards, and a booking may take the slot the
    /// moment this returns. Result is in registry order.
    pub async fn find_available(
        &self,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
        filter: &AvailabilityFilter,
    ) -> Result<Vec<Resource>, EngineError> {
        let span = validate_range(date, start, end)?;
        let started = Instant::now();

        let mut free = Vec::new();
        for slot in self.registry_snapshot() {
            let guard = slot.state.read().await;
            if guard.retired || !filter.matches(&guard.resource) {
                continue;
            }
            if find_conflict(&guard, date, span).is_none() {
                free.push(guard.resource.clone());
            }
        }

        metrics::histogram!(AVAILABILITY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(free)
    }

    /// Maximal free sub-intervals of `window` on `date` for one resource.
    pub async fn free_windows(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        window: Span,
    ) -> Result<Vec<Span>, EngineError> {
        validate_range(date, window.start, window.end)?;
        let rs = self
            .get_resource_state(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::ResourceNotFound(resource_id));
        }

        let busy: Vec<Span> = guard.overlapping(date, window).map(|r| r.span).collect();
        Ok(subtract_intervals(&[window], &merge_overlapping(&busy)))
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Subtract sorted, disjoint `to_remove` spans from sorted `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
