use ulid::Ulid;

use crate::model::*;

use super::conflict::{is_free, validate_interval};
use super::{Engine, EngineError, SharedSpaceState};

// ── Space Pool ────────────────────────────────────────────────────

/// A space is available for `query` iff it is active and every retained
/// reservation (all but `exclude`) is non-overlapping with `query`.
pub fn space_available(space: &SpaceState, query: &Interval, exclude: Option<Ulid>) -> bool {
    space.active && is_free(space, query, exclude)
}

impl Engine {
    /// Active spaces free for `interval`, in pool order. Read-only: each space
    /// is read-locked only while it is checked, so the result can be stale by
    /// the time the caller acts on it.
    pub async fn query_availability(
        &self,
        interval: Interval,
        exclude: Option<Ulid>,
    ) -> Result<Vec<SpaceInfo>, EngineError> {
        validate_interval(&interval)?;
        let mut free = Vec::new();
        for (_, handle) in self.store.pool() {
            let guard = self.lock_read(handle).await?;
            if space_available(&guard, &interval, exclude) {
                free.push(guard.info());
            }
        }
        Ok(free)
    }

    /// First-fit: the first pool-order space available for `interval`.
    pub(super) async fn first_available(
        &self,
        interval: &Interval,
        exclude: Option<Ulid>,
    ) -> Result<Option<(Ulid, SharedSpaceState)>, EngineError> {
        for (id, handle) in self.store.pool() {
            let guard = self.lock_read(handle.clone()).await?;
            if space_available(&guard, interval, exclude) {
                return Ok(Some((id, handle)));
            }
        }
        Ok(None)
    }
}
