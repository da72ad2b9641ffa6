use crate::model::Ms;

// ── Per-car-park limits ──────────────────────────────────────────

pub const MAX_SPACES_PER_LOT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_SPACE: usize = 10_000;
pub const MAX_TERMINAL_LEN: usize = 256;

// ── Time limits ──────────────────────────────────────────────────

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single reservation may not exceed one year.
pub const MAX_RESERVATION_DURATION_MS: Ms = 366 * 24 * 3_600_000;

// ── Server limits ────────────────────────────────────────────────

pub const MAX_LOTS: usize = 1_000;
pub const MAX_LOT_NAME_LEN: usize = 63;

// ── Storage limits ──

/// Largest encoded event accepted in a WAL entry. Replay treats a larger
/// length prefix as corruption.
pub const MAX_WAL_ENTRY_BYTES: usize = 1 << 20;
