use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// All spaces in pool order.
    pub async fn list_spaces(&self) -> Result<Vec<SpaceInfo>, EngineError> {
        let mut spaces = Vec::new();
        for (_, handle) in self.store.pool() {
            spaces.push(self.lock_read(handle).await?.info());
        }
        Ok(spaces)
    }

    pub async fn get_space(&self, id: Ulid) -> Result<SpaceInfo, EngineError> {
        let handle = self.store.get_space(&id).ok_or(EngineError::NotFound(id))?;
        Ok(self.lock_read(handle).await?.info())
    }

    /// Reservations on one space (insertion order), or on every space in pool
    /// order. An unknown space yields an empty list.
    pub async fn list_reservations(&self, space_id: Option<Ulid>) -> Result<Vec<Reservation>, EngineError> {
        let handles = match space_id {
            Some(id) => self.store.get_space(&id).map(|h| vec![(id, h)]).unwrap_or_default(),
            None => self.store.pool(),
        };
        let mut out = Vec::new();
        for (_, handle) in handles {
            let guard = self.lock_read(handle).await?;
            out.extend(guard.reservations.iter().cloned());
        }
        Ok(out)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        // The reservation may be relocated between lookup and read; look again.
        for _ in 0..2 {
            let space_id = self
                .store
                .space_for_reservation(&id)
                .ok_or(EngineError::NotFound(id))?;
            let Some(handle) = self.store.get_space(&space_id) else {
                continue;
            };
            let guard = self.lock_read(handle).await?;
            if let Some(r) = guard.reservation(id) {
                return Ok(r.clone());
            }
        }
        Err(EngineError::NotFound(id))
    }

    pub fn space_count(&self) -> usize {
        self.store.space_count()
    }

    pub fn reservation_count(&self) -> usize {
        self.store.reservation_count()
    }
}
