use chrono::{NaiveDate, Utc};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, CANCELLATIONS_TOTAL};

use super::conflict::{check_no_conflict, validate_range};
use super::{Engine, EngineError};

/// A booking attempt as received from a caller. The actor comes from the
/// authenticated session and is recorded verbatim.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub motif: Option<String>,
    pub actor: String,
}

impl Engine {
    /// Book `[start, end)` on `date` for one resource.
    ///
    /// The conflict check runs against the store under the resource's write
    /// lock, right before the insert, so two overlapping attempts on the same
    /// resource can never both succeed. Nothing a caller learned from an
    /// earlier availability query is trusted here.
    pub async fn book(&self, request: BookingRequest) -> Result<Reservation, EngineError> {
        let result = self.book_inner(request).await;
        let outcome = match &result {
            Ok(_) => "confirmed",
            Err(EngineError::Conflict { .. }) => "conflict",
            Err(EngineError::Timeout(_)) => "timeout",
            Err(EngineError::InvalidRange(_) | EngineError::LimitExceeded(_)) => "rejected",
            Err(EngineError::ResourceNotFound(_)) => "not_found",
            Err(_) => "error",
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn book_inner(&self, request: BookingRequest) -> Result<Reservation, EngineError> {
        let BookingRequest {
            resource_id,
            date,
            start,
            end,
            motif,
            actor,
        } = request;

        let span = validate_range(date, start, end)?;
        if motif.as_ref().is_some_and(|m| m.len() > MAX_MOTIF_LEN) {
            return Err(EngineError::LimitExceeded("motif too long"));
        }
        if actor.len() > MAX_ACTOR_LEN {
            return Err(EngineError::LimitExceeded("actor identity too long"));
        }
        if !self.state.contains_key(&resource_id) {
            return Err(EngineError::ResourceNotFound(resource_id));
        }

        // ── critical section: read, check, write for this resource only ──
        let mut guard = self.lock_resource(resource_id).await?;
        check_no_conflict(&guard, date, span)?;

        let reservation = Reservation {
            id: Ulid::new(),
            resource_id,
            date,
            span,
            motif,
            created_by: actor,
            status: ReservationStatus::Confirmed,
            created_at: Utc::now(),
        };
        let event = Event::ReservationConfirmed {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        tracing::debug!(
            "booked {} on {} {} {} for {}",
            reservation.id,
            resource_id,
            date,
            span,
            reservation.created_by
        );
        Ok(reservation)
    }

    /// Cancel a confirmed reservation, freeing its interval.
    ///
    /// Unknown ids and already-cancelled ids both yield `NotFound`.
    pub async fn cancel(&self, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        let (resource_id, date) = self
            .reservation_index
            .get(&reservation_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(reservation_id))?;

        let mut guard = self.lock_resource(resource_id).await?;
        // A concurrent cancel may have won while we waited for the lock.
        let mut reservation = guard
            .reservations_on(date)
            .iter()
            .find(|r| r.id == reservation_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))?;
        reservation.status = ReservationStatus::Cancelled;

        let event = Event::ReservationCancelled {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(CANCELLATIONS_TOTAL).increment(1);
        tracing::debug!("cancelled {reservation_id} on {resource_id} {date}");
        Ok(reservation)
    }
}
