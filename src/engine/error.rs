use ulid::Ulid;

use crate::model::Interval;

#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    /// `from >= to`.
    InvalidInterval(Interval),
    NotFound(Ulid),
    NoSpaceAvailable(Interval),
    /// A concurrent commit invalidated the allocation decision twice in a row.
    Conflict(Ulid),
    AlreadyExists(Ulid),
    HasReservations(Ulid),
    LimitExceeded(&'static str),
    /// Lock wait exceeded the configured operation timeout; nothing was written.
    Timeout,
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval(i) => {
                write!(f, "invalid interval [{}, {}): from must be before to", i.from, i.to)
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::NoSpaceAvailable(i) => {
                write!(f, "no space available for [{}, {})", i.from, i.to)
            }
            EngineError::Conflict(id) => {
                write!(f, "conflict: concurrent change on space {id}, retry")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::HasReservations(id) => {
                write!(f, "cannot delete space {id}: has reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout => write!(f, "operation timed out"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
