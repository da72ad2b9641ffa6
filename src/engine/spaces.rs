use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{shared, Engine, EngineError};

impl Engine {
    pub async fn create_space(&self, id: Ulid, terminal: String, active: bool) -> Result<(), EngineError> {
        if terminal.len() > MAX_TERMINAL_LEN {
            return Err(EngineError::LimitExceeded("terminal label too long"));
        }
        let _commit = self.enter_commit().await?;
        if self.store.space_count() >= MAX_SPACES_PER_LOT {
            return Err(EngineError::LimitExceeded("too many spaces"));
        }

        // Claim the id with the new space write-locked, so allocations that
        // find it in the pool wait until the create is durable.
        let handle = shared(SpaceState::new(id, terminal.clone(), active));
        let guard = self.lock_write(handle.clone()).await?;
        if !self.store.try_insert_space(id, &handle) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::SpaceCreated { id, terminal, active };
        if let Err(e) = self.wal_append(&event).await {
            self.store.remove_space_if_current(&id, &handle);
            return Err(e);
        }
        drop(guard);
        info!("space {id} created (active: {active})");
        Ok(())
    }

    /// Relabel or (de)activate a space. `None` keeps the current value. Its
    /// reservations are untouched; an inactive space just stops showing up
    /// as available.
    pub async fn update_space(
        &self,
        id: Ulid,
        terminal: Option<String>,
        active: Option<bool>,
    ) -> Result<SpaceInfo, EngineError> {
        if terminal.as_ref().is_some_and(|t| t.len() > MAX_TERMINAL_LEN) {
            return Err(EngineError::LimitExceeded("terminal label too long"));
        }
        let _commit = self.enter_commit().await?;
        let handle = self.store.get_space(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = self.lock_write(handle.clone()).await?;
        if !self.store.is_current(&id, &handle) {
            return Err(EngineError::NotFound(id));
        }

        let terminal = terminal.unwrap_or_else(|| guard.terminal.clone());
        let active = active.unwrap_or(guard.active);
        let event = Event::SpaceUpdated { id, terminal, active };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("space {id} updated (active: {active})");
        Ok(guard.info())
    }

    /// Delete a space that owns no reservations. Never cascades.
    pub async fn delete_space(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.enter_commit().await?;
        let handle = self.store.get_space(&id).ok_or(EngineError::NotFound(id))?;
        // Held across the removal so no allocation can land on a space being deleted.
        let guard = self.lock_write(handle.clone()).await?;
        if !self.store.is_current(&id, &handle) {
            return Err(EngineError::NotFound(id));
        }
        if !guard.reservations.is_empty() {
            return Err(EngineError::HasReservations(id));
        }

        let event = Event::SpaceDeleted { id };
        self.wal_append(&event).await?;
        self.store.remove_space(&id);
        drop(guard);
        info!("space {id} deleted");
        Ok(())
    }
}
