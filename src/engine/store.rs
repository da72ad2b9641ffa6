use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::shared;

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;

/// Canonical spaces and reservations for one car park.
///
/// A reservation carries its space id; the per-space reservation list is the
/// index keyed by space. `reservation_to_space` is the reverse lookup.
pub struct SpaceStore {
    spaces: DashMap<Ulid, SharedSpaceState>,
    /// Space id → insertion sequence. Sorting by it yields pool order.
    pool_seq: DashMap<Ulid, u64>,
    next_seq: AtomicU64,
    reservation_to_space: DashMap<Ulid, Ulid>,
}

impl Default for SpaceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceStore {
    pub fn new() -> Self {
        Self {
            spaces: DashMap::new(),
            pool_seq: DashMap::new(),
            next_seq: AtomicU64::new(0),
            reservation_to_space: DashMap::new(),
        }
    }

    // ── Spaces ───────────────────────────────────────────────

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    pub fn contains_space(&self, id: &Ulid) -> bool {
        self.spaces.contains_key(id)
    }

    pub fn get_space(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    /// True if `handle` is still the live state for `id` (not deleted or replaced).
    pub fn is_current(&self, id: &Ulid, handle: &SharedSpaceState) -> bool {
        self.spaces
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), handle))
    }

    pub fn insert_space(&self, state: SpaceState) -> SharedSpaceState {
        let id = state.id;
        let handle = shared(state);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pool_seq.insert(id, seq);
        self.spaces.insert(id, handle.clone());
        handle
    }

    /// Publish `handle` under `id` unless the id is already taken. The check
    /// and the insert happen under the same shard lock.
    pub fn try_insert_space(&self, id: Ulid, handle: &SharedSpaceState) -> bool {
        match self.spaces.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                self.pool_seq.insert(id, seq);
                slot.insert(handle.clone());
                true
            }
        }
    }

    /// Remove `id` only while it still maps to `handle`.
    pub fn remove_space_if_current(&self, id: &Ulid, handle: &SharedSpaceState) -> bool {
        match self.spaces.entry(*id) {
            Entry::Occupied(slot) if Arc::ptr_eq(slot.get(), handle) => {
                self.pool_seq.remove(id);
                slot.remove();
                true
            }
            _ => false,
        }
    }

    pub fn remove_space(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.pool_seq.remove(id);
        self.spaces.remove(id).map(|(_, handle)| handle)
    }

    /// All spaces in pool (insertion) order.
    pub fn pool(&self) -> Vec<(Ulid, SharedSpaceState)> {
        let mut ordered: Vec<(u64, Ulid)> = self
            .pool_seq
            .iter()
            .map(|e| (*e.value(), *e.key()))
            .collect();
        ordered.sort_unstable();
        ordered
            .into_iter()
            .filter_map(|(_, id)| self.get_space(&id).map(|handle| (id, handle)))
            .collect()
    }

    // ── Reservation index ────────────────────────────────────

    pub fn space_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_space
            .get(reservation_id)
            .map(|e| *e.value())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_to_space.len()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a single-space event. Caller holds the space's write lock.
    pub fn apply_event(&self, space: &mut SpaceState, event: &Event) {
        match event {
            Event::ReservationCreated {
                id,
                space_id,
                interval,
                created,
            } => {
                space.push_reservation(Reservation {
                    id: *id,
                    space_id: *space_id,
                    interval: *interval,
                    created: *created,
                });
                self.reservation_to_space.insert(*id, *space_id);
            }
            Event::ReservationAmended { id, interval, .. } => {
                if let Some(r) = space.reservations.iter_mut().find(|r| r.id == *id) {
                    r.interval = *interval;
                }
            }
            Event::ReservationDeleted { id, .. } => {
                space.remove_reservation(*id);
                self.reservation_to_space.remove(id);
            }
            Event::SpaceUpdated { terminal, active, .. } => {
                space.terminal = terminal.clone();
                space.active = *active;
            }
            // Created/Deleted are map-level; Moved needs both spaces (see apply_move).
            Event::SpaceCreated { .. } | Event::SpaceDeleted { .. } | Event::ReservationMoved { .. } => {}
        }
    }

    /// Apply a relocation. Caller holds both write locks.
    pub fn apply_move(&self, source: &mut SpaceState, target: &mut SpaceState, event: &Event) {
        let Event::ReservationMoved {
            id,
            to_space_id,
            interval,
            ..
        } = event
        else {
            return;
        };
        if let Some(mut r) = source.remove_reservation(*id) {
            r.space_id = *to_space_id;
            r.interval = *interval;
            target.push_reservation(r);
            self.reservation_to_space.insert(*id, *to_space_id);
        }
    }

    /// Apply an event read back from the WAL at startup.
    pub(super) fn replay_event(&self, event: &Event) {
        match event {
            Event::SpaceCreated { id, terminal, active } => {
                self.insert_space(SpaceState::new(*id, terminal.clone(), *active));
            }
            Event::SpaceDeleted { id } => {
                self.remove_space(id);
            }
            Event::ReservationMoved {
                from_space_id,
                to_space_id,
                ..
            } => {
                let (Some(source), Some(target)) =
                    (self.get_space(from_space_id), self.get_space(to_space_id))
                else {
                    return;
                };
                let mut source = source.try_write().expect("replay: uncontended write");
                let mut target = target.try_write().expect("replay: uncontended write");
                self.apply_move(&mut source, &mut target, event);
            }
            Event::ReservationCreated { space_id, .. }
            | Event::ReservationAmended { space_id, .. }
            | Event::ReservationDeleted { space_id, .. }
            | Event::SpaceUpdated { id: space_id, .. } => {
                if let Some(handle) = self.get_space(space_id) {
                    let mut guard = handle.try_write().expect("replay: uncontended write");
                    self.apply_event(&mut guard, event);
                }
            }
        }
    }
}
