use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_interval(interval: &Interval) -> Result<(), EngineError> {
    if !interval.is_valid() {
        return Err(EngineError::InvalidInterval(*interval));
    }
    if interval.from < MIN_VALID_TIMESTAMP_MS || interval.to > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if interval.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// The first reservation on `space` (other than `exclude`) that overlaps `interval`.
pub(crate) fn first_overlap(space: &SpaceState, interval: &Interval, exclude: Option<Ulid>) -> Option<Ulid> {
    space.overlapping(interval, exclude).next().map(|r| r.id)
}

/// A space can take `interval` iff no retained reservation overlaps it.
/// This is the only overlap check: fresh allocation and amendment both use it.
pub(crate) fn is_free(space: &SpaceState, interval: &Interval, exclude: Option<Ulid>) -> bool {
    first_overlap(space, interval, exclude).is_none()
}
