use crate::model::{Ms, HOUR_MS, MINUTE_MS};

// ── Admission windows ────────────────────────────────────────────

/// Class bookings close this long before the occurrence starts.
pub const BOOKING_CUTOFF_MS: Ms = 2 * HOUR_MS;

/// Class cancellations close this long before the occurrence starts.
pub const CANCELLATION_CUTOFF_MS: Ms = 4 * HOUR_MS;

pub const MIN_APPOINTMENT_MS: Ms = 30 * MINUTE_MS;
pub const MAX_APPOINTMENT_MS: Ms = 120 * MINUTE_MS;

// ── Input sizes ──────────────────────────────────────────────────

pub const MAX_NOTES_LEN: usize = 1_000;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_LOCATION_LEN: usize = 200;
pub const MAX_FOCUS_LEN: usize = 500;

// ── Resource bounds ──────────────────────────────────────────────

pub const MAX_CAPACITY: u32 = 500;
/// Reservation rows kept per occurrence, cancelled ones included.
pub const MAX_RESERVATIONS_PER_OCCURRENCE: usize = 5_000;
pub const MAX_SLOTS_PER_TRAINER: usize = 50_000;
pub const MAX_HOURLY_RATE: i64 = 1_000_000;

/// Longest line accepted by the wire protocol.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
