mod availability;
mod booking;
mod conflict;
mod error;
mod queries;
mod registry;
#[cfg(test)]
mod tests;

pub use availability::{merge_overlapping, subtract_intervals};
pub use booking::BookingRequest;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Registry entry. `seq` is fixed at registration and defines registry order.
#[derive(Clone)]
pub(super) struct Slot {
    pub(super) seq: u64,
    pub(super) state: SharedResourceState,
}

/// Default bound on waiting for a resource's write lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The reservation store: registry, per-resource day schedules, and the WAL.
///
/// Every mutation of a resource's reservations happens under that resource's
/// write lock, so check-then-insert is indivisible per resource while
/// different resources proceed in parallel.
pub struct Engine {
    pub(super) state: DashMap<Ulid, Slot>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Confirmed reservation id → (resource id, date).
    pub(super) reservation_index: DashMap<Ulid, (Ulid, NaiveDate)>,
    /// Cancelled reservations, kept for lookups until compaction expires them.
    pub(super) cancelled: DashMap<Ulid, Reservation>,
    pub(super) next_seq: AtomicU64,
    pub(super) lock_timeout: Duration,
    /// Mutations hold this shared; compaction holds it exclusively so its
    /// snapshot and the log swap see no in-flight appends.
    pub(super) compaction_gate: Arc<RwLock<()>>,
    /// Serializes catalog inserts: the duplicate and limit checks, the
    /// journal append and the insert happen as one step.
    pub(super) registration: Mutex<()>,
}

/// Write access to one resource, plus the shared compaction gate.
pub(super) struct WriteLease {
    guard: OwnedRwLockWriteGuard<ResourceState>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl std::ops::Deref for WriteLease {
    type Target = ResourceState;

    fn deref(&self) -> &ResourceState {
        &self.guard
    }
}

impl std::ops::DerefMut for WriteLease {
    fn deref_mut(&mut self) -> &mut ResourceState {
        &mut self.guard
    }
}

/// Apply a reservation event to a ResourceState. Caller holds the lock.
fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    index: &DashMap<Ulid, (Ulid, NaiveDate)>,
    cancelled: &DashMap<Ulid, Reservation>,
) {
    match event {
        Event::ReservationConfirmed { reservation } => {
            index.insert(reservation.id, (reservation.resource_id, reservation.date));
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationCancelled { reservation } => {
            rs.remove_reservation(reservation.date, reservation.id);
            index.remove(&reservation.id);
            cancelled.insert(reservation.id, reservation.clone());
        }
        Event::ResourceUpdated { resource } => {
            rs.resource = resource.clone();
        }
        // Registration and removal are handled at the DashMap level, not here
        Event::ResourceRegistered { .. } | Event::ResourceRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            reservation_index: DashMap::new(),
            cancelled: DashMap::new(),
            next_seq: AtomicU64::new(0),
            lock_timeout,
            compaction_gate: Arc::new(RwLock::new(())),
            registration: Mutex::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds instantly. Never use blocking_write here: this runs inside
        // an async context.
        for event in &events {
            match event {
                Event::ResourceRegistered { resource } => {
                    let seq = engine.next_seq.fetch_add(1, Ordering::Relaxed);
                    let rs = ResourceState::new(resource.clone());
                    engine.state.insert(
                        resource.id,
                        Slot {
                            seq,
                            state: Arc::new(RwLock::new(rs)),
                        },
                    );
                }
                Event::ResourceRemoved { id } => {
                    engine.state.remove(id);
                }
                Event::ReservationCancelled { reservation } if !engine.state.contains_key(&reservation.resource_id) => {
                    engine.reservation_index.remove(&reservation.id);
                    engine.cancelled.insert(reservation.id, reservation.clone());
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = engine.state.get(&resource_id)
                    {
                        let rs_arc = entry.state.clone();
                        let mut guard = rs_arc.try_write().map_err(|_| {
                            io::Error::other(format!("replay: resource {resource_id} locked"))
                        })?;
                        apply_to_resource(&mut guard, other, &engine.reservation_index, &engine.cancelled);
                    }
                }
            }
        }

        tracing::info!(
            "replayed {} events: {} resources, {} confirmed reservations",
            events.len(),
            engine.state.len(),
            engine.reservation_index.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub(super) fn get_resource_state(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().state.clone())
    }

    /// Snapshot of the registry sorted by registration order. Locks are taken
    /// afterwards so no DashMap shard guard is held across an await.
    pub(super) fn registry_snapshot(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self.state.iter().map(|e| e.value().clone()).collect();
        slots.sort_by_key(|s| s.seq);
        slots
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.reservation_index, &self.cancelled);
        Ok(())
    }

    /// Acquire a resource's write lock, giving up after `lock_timeout`.
    pub(super) async fn lock_resource(&self, resource_id: Ulid) -> Result<WriteLease, EngineError> {
        let rs = self
            .get_resource_state(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let gate = self.compaction_gate.clone();
        let wait_start = Instant::now();
        let acquire = async move {
            let gate = gate.read_owned().await;
            let guard = rs.write_owned().await;
            (gate, guard)
        };
        let (gate, guard) = match tokio::time::timeout(self.lock_timeout, acquire).await {
            Ok(pair) => pair,
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(
                    "lock wait on resource {resource_id} exceeded {:?}",
                    self.lock_timeout
                );
                return Err(EngineError::Timeout(resource_id));
            }
        };
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());
        if guard.retired {
            return Err(EngineError::ResourceNotFound(resource_id));
        }
        Ok(WriteLease { guard, _gate: gate })
    }
}

/// Extract the resource_id from a non-registration event.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationConfirmed { reservation } | Event::ReservationCancelled { reservation } => {
            Some(reservation.resource_id)
        }
        Event::ResourceUpdated { resource } => Some(resource.id),
        Event::ResourceRegistered { .. } | Event::ResourceRemoved { .. } => None,
    }
}
