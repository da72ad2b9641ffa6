use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ALLOCATION_CONFLICTS_TOTAL, ALLOCATIONS_TOTAL};

use super::availability::space_available;
use super::conflict::{first_overlap, now_ms, validate_interval};
use super::{Engine, EngineError};

/// An allocation decision is made, then re-validated under the space's write
/// lock. If a concurrent commit invalidated it, the decision is re-run once.
const ALLOCATION_ATTEMPTS: usize = 2;

fn record(op: &'static str, outcome: &'static str) {
    metrics::counter!(ALLOCATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}

fn record_err<T>(op: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(e) = &result {
        let outcome = match e {
            EngineError::NoSpaceAvailable(_) => "no_space",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::Timeout => "timeout",
            _ => "error",
        };
        record(op, outcome);
    }
    result
}

impl Engine {
    /// Allocate the first free active space in pool order and bind a new
    /// reservation for `interval` to it.
    pub async fn create_reservation(&self, interval: Interval) -> Result<Reservation, EngineError> {
        record_err("create", self.try_create(interval).await)
    }

    async fn try_create(&self, interval: Interval) -> Result<Reservation, EngineError> {
        validate_interval(&interval)?;
        let _commit = self.enter_commit().await?;

        let mut contended = None;
        for attempt in 0..ALLOCATION_ATTEMPTS {
            let Some((space_id, handle)) = self.first_available(&interval, None).await? else {
                return Err(EngineError::NoSpaceAvailable(interval));
            };

            #[cfg(test)]
            self.run_before_commit_lock(space_id);
            let mut guard = self.lock_write(handle.clone()).await?;
            if !self.store.is_current(&space_id, &handle) || !space_available(&guard, &interval, None) {
                warn!(
                    "create [{}, {}): space {space_id} taken before commit (attempt {})",
                    interval.from,
                    interval.to,
                    attempt + 1
                );
                metrics::counter!(ALLOCATION_CONFLICTS_TOTAL, "op" => "create").increment(1);
                contended = Some(space_id);
                continue;
            }
            if guard.reservations.len() >= MAX_RESERVATIONS_PER_SPACE {
                return Err(EngineError::LimitExceeded("too many reservations on space"));
            }

            let reservation = Reservation {
                id: Ulid::new(),
                space_id,
                interval,
                created: now_ms(),
            };
            let event = Event::ReservationCreated {
                id: reservation.id,
                space_id,
                interval,
                created: reservation.created,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            debug!(
                "reservation {} → space {space_id} [{}, {})",
                reservation.id, interval.from, interval.to
            );
            record("create", "ok");
            return Ok(reservation);
        }

        Err(EngineError::Conflict(contended.unwrap_or_else(Ulid::nil)))
    }

    /// Change a reservation's interval, keeping its space when the new interval
    /// still fits there and otherwise relocating it to the first free space.
    /// On any error the stored reservation is left exactly as it was.
    pub async fn amend_reservation(&self, id: Ulid, interval: Interval) -> Result<Reservation, EngineError> {
        record_err("amend", self.try_amend(id, interval).await)
    }

    async fn try_amend(&self, id: Ulid, interval: Interval) -> Result<Reservation, EngineError> {
        if self.store.space_for_reservation(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        validate_interval(&interval)?;
        let _commit = self.enter_commit().await?;

        let mut contended = None;
        for attempt in 0..ALLOCATION_ATTEMPTS {
            // Current space first: only its *other* reservations count.
            let (space_id, mut current) = self.lock_reservation_space(id).await?;
            match first_overlap(&current, &interval, Some(id)) {
                None => {
                    let event = Event::ReservationAmended { id, space_id, interval };
                    self.persist_and_apply(&mut current, &event).await?;
                    debug!("reservation {id} amended in place on space {space_id}");
                    record("amend", "in_place");
                    return current
                        .reservation(id)
                        .cloned()
                        .ok_or(EngineError::NotFound(id));
                }
                Some(blocker) => {
                    debug!("reservation {id}: space {space_id} blocked by {blocker}, reallocating");
                }
            }
            // Release before scanning the pool; the scan read-locks every space.
            drop(current);

            let Some((target_id, target)) = self.first_available(&interval, Some(id)).await? else {
                return Err(EngineError::NoSpaceAvailable(interval));
            };
            if target_id == space_id {
                // The current space freed up since we looked; re-run the in-place path.
                contended = Some(space_id);
                continue;
            }
            let Some(source) = self.store.get_space(&space_id) else {
                contended = Some(space_id);
                continue;
            };

            #[cfg(test)]
            self.run_before_commit_lock(target_id);
            let (mut source_guard, mut target_guard) = self
                .lock_pair((space_id, source), (target_id, target.clone()))
                .await?;
            let still_bound = source_guard.contains_reservation(id);
            let target_ok = self.store.is_current(&target_id, &target)
                && space_available(&target_guard, &interval, Some(id));
            if !still_bound || !target_ok {
                warn!(
                    "amend {id}: move {space_id} → {target_id} invalidated before commit (attempt {})",
                    attempt + 1
                );
                metrics::counter!(ALLOCATION_CONFLICTS_TOTAL, "op" => "amend").increment(1);
                contended = Some(target_id);
                continue;
            }
            if target_guard.reservations.len() >= MAX_RESERVATIONS_PER_SPACE {
                return Err(EngineError::LimitExceeded("too many reservations on space"));
            }

            let event = Event::ReservationMoved {
                id,
                from_space_id: space_id,
                to_space_id: target_id,
                interval,
            };
            self.persist_and_apply_move(&mut source_guard, &mut target_guard, &event)
                .await?;
            debug!("reservation {id} moved {space_id} → {target_id}");
            record("amend", "moved");
            return target_guard
                .reservation(id)
                .cloned()
                .ok_or(EngineError::NotFound(id));
        }

        Err(EngineError::Conflict(contended.unwrap_or(id)))
    }

    /// Cancel a reservation, freeing its interval on its space. Returns the
    /// space it was bound to.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        record_err("delete", self.try_delete(id).await)
    }

    async fn try_delete(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _commit = self.enter_commit().await?;
        let (space_id, mut guard) = self.lock_reservation_space(id).await?;
        let event = Event::ReservationDeleted { id, space_id };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("reservation {id} deleted from space {space_id}");
        record("delete", "ok");
        Ok(space_id)
    }
}
