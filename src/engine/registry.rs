use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_resource;
use super::{Engine, EngineError, Slot};

impl Engine {
    /// Add a room to the catalog. Journaled before it becomes visible.
    pub async fn register_resource(&self, resource: Resource) -> Result<(), EngineError> {
        validate_resource(&resource)?;
        let _registering = self.registration.lock().await;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.state.contains_key(&resource.id) {
            return Err(EngineError::AlreadyExists(resource.id));
        }

        let _gate = self.compaction_gate.read().await;
        let id = resource.id;
        let event = Event::ResourceRegistered { resource: resource.clone() };
        self.wal_append(&event).await?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.state.insert(
            id,
            Slot {
                seq,
                state: Arc::new(RwLock::new(ResourceState::new(resource))),
            },
        );
        tracing::info!("registered resource {id}");
        Ok(())
    }

    /// Replace a resource's descriptive fields. Reservations are untouched.
    pub async fn update_resource(&self, resource: Resource) -> Result<(), EngineError> {
        validate_resource(&resource)?;
        let mut guard = self.lock_resource(resource.id).await?;
        let event = Event::ResourceUpdated { resource };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove a room from the catalog. Refused while it holds confirmed reservations.
    pub async fn remove_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_resource(id).await?;
        if guard.reservation_count() > 0 {
            return Err(EngineError::HasReservations(id));
        }

        let event = Event::ResourceRemoved { id };
        self.wal_append(&event).await?;
        guard.retired = true;
        self.state.remove(&id);
        tracing::info!("removed resource {id}");
        Ok(())
    }

    pub async fn get_resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        let rs = self
            .get_resource_state(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::ResourceNotFound(id));
        }
        Ok(guard.resource.clone())
    }

    /// All registered resources in registration order.
    pub async fn list_resources(&self) -> Vec<Resource> {
        let mut out = Vec::with_capacity(self.state.len());
        for slot in self.registry_snapshot() {
            let guard = slot.state.read().await;
            if !guard.retired {
                out.push(guard.resource.clone());
            }
        }
        out
    }
}
