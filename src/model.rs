use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only time type.
pub type Ms = i64;

/// Half-open interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub from: Ms,
    pub to: Ms,
}

impl Interval {
    /// Build an interval without checking it. Callers validate with
    /// [`Interval::is_valid`] before handing it to the engine.
    pub fn new(from: Ms, to: Ms) -> Self {
        Self { from, to }
    }

    pub fn is_valid(&self) -> bool {
        self.from < self.to
    }

    pub fn duration_ms(&self) -> Ms {
        self.to - self.from
    }

    /// Two intervals overlap unless one ends at or before the other begins.
    /// Touching intervals (`a.to == b.from`) do not overlap.
    pub fn overlaps(&self, other: &Interval) -> bool {
        !(self.to <= other.from || other.to <= self.from)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.from <= t && t < self.to
    }
}

/// A binding of one interval to one space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub space_id: Ulid,
    pub interval: Interval,
    pub created: Ms,
}

/// A parking space and the reservations currently bound to it.
#[derive(Debug, Clone)]
pub struct SpaceState {
    pub id: Ulid,
    pub terminal: String,
    pub active: bool,
    /// Bound reservations in insertion order (not time order).
    pub reservations: Vec<Reservation>,
}

impl SpaceState {
    pub fn new(id: Ulid, terminal: String, active: bool) -> Self {
        Self {
            id,
            terminal,
            active,
            reservations: Vec::new(),
        }
    }

    pub fn push_reservation(&mut self, reservation: Reservation) {
        self.reservations.push(reservation);
    }

    /// Remove reservation by id.
    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn contains_reservation(&self, id: Ulid) -> bool {
        self.reservations.iter().any(|r| r.id == id)
    }

    /// Reservations whose interval overlaps `query`, skipping `exclude`.
    pub fn overlapping<'a>(
        &'a self,
        query: &'a Interval,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &'a Reservation> {
        self.reservations
            .iter()
            .filter(move |r| Some(r.id) != exclude && r.interval.overlaps(query))
    }

    pub fn info(&self) -> SpaceInfo {
        SpaceInfo {
            id: self.id,
            terminal: self.terminal.clone(),
            active: self.active,
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
/// Each event is one atomic commit: a relocation is a single `ReservationMoved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceCreated {
        id: Ulid,
        terminal: String,
        active: bool,
    },
    SpaceUpdated {
        id: Ulid,
        terminal: String,
        active: bool,
    },
    SpaceDeleted {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        space_id: Ulid,
        interval: Interval,
        created: Ms,
    },
    /// New interval, same space.
    ReservationAmended {
        id: Ulid,
        space_id: Ulid,
        interval: Interval,
    },
    /// New interval on a different space.
    ReservationMoved {
        id: Ulid,
        from_space_id: Ulid,
        to_space_id: Ulid,
        interval: Interval,
    },
    ReservationDeleted {
        id: Ulid,
        space_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceInfo {
    pub id: Ulid,
    pub terminal: String,
    pub active: bool,
}
