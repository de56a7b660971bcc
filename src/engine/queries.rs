
use chrono::NaiveDate;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Confirmed reservations for one resource on one day, ascending by start.
    /// An unknown resource simply has none.
    pub async fn reservations_for(&self, resource_id: Ulid, date: NaiveDate) -> Vec<Reservation> {
        let Some(rs) = self.get_resource_state(&resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard.reservations_on(date).to_vec()
    }

    /// Look up a reservation by id, confirmed or cancelled.
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        if let Some(r) = self.cancelled.get(&id) {
            return Ok(r.value().clone());
        }
        let (resource_id, date) = self
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource_state(&resource_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        if let Some(r) = guard.reservations_on(date).iter().find(|r| r.id == id) {
            return Ok(r.clone());
        }
        drop(guard);
        // Cancelled between the index lookup and the read lock.
        self.cancelled
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn resource_count(&self) -> usize {
        self.state.len()
    }

    pub fn confirmed_count(&self) -> usize {
        self.reservation_index.len()
    }

    /// Compact the WAL into the minimal event set recreating the current state.
    ///
    /// Cancelled tombstones dated before `keep_cancelled_from` are dropped
    /// from memory and from the rewritten log.
    pub async fn compact_wal(&self, keep_cancelled_from: NaiveDate) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        self.cancelled
            .retain(|_, r| r.date >= keep_cancelled_from);

        let mut events = Vec::new();
        for slot in self.registry_snapshot() {
            let guard = slot.state.read().await;
            if guard.retired {
                continue;
            }
            events.push(Event::ResourceRegistered {
                resource: guard.resource.clone(),
            });
            for reservation in guard.days.values().flatten() {
                events.push(Event::ReservationConfirmed {
                    reservation: reservation.clone(),
                });
            }
        }
        let mut tombstones: Vec<Reservation> =
            self.cancelled.iter().map(|e| e.value().clone()).collect();
        tombstones.sort_by_key(|r| r.id);
        events.extend(
            tombstones
                .into_iter()
                .map(|reservation| Event::ReservationCancelled { reservation }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
