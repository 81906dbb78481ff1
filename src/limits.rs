use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Slot queries cover at most this many calendar days (inclusive range).
pub const MAX_SLOT_QUERY_DAYS: i64 = 31;

/// Allowed drift between a booked span and the consultation type's duration.
pub const DURATION_TOLERANCE_MS: Ms = MINUTE_MS;

pub const MAX_APPOINTMENT_DURATION_MS: Ms = 12 * HOUR_MS;
pub const MAX_BLOCK_DURATION_MS: Ms = 366 * DAY_MS;
pub const MAX_BUFFER_MS: Ms = 4 * HOUR_MS;
pub const MAX_LEAD_TIME_MS: Ms = 730 * DAY_MS;
pub const MAX_SOFT_HOLD_TTL_MS: Ms = 7 * DAY_MS;

pub const MAX_PROFESSIONALS: usize = 100_000;
pub const MAX_LOCATIONS_PER_PROFESSIONAL: usize = 64;
pub const MAX_CONSULTATION_TYPES_PER_PROFESSIONAL: usize = 128;
pub const MAX_RULES_PER_CALENDAR: usize = 256;
pub const MAX_BLOCKS_PER_CALENDAR: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_CALENDAR: usize = 200_000;
pub const MAX_WAITLIST_ENTRIES: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_048;
pub const MAX_TIMEZONE_LEN: usize = 64;

/// Durable commit attempts before a mutation fails with `Unavailable`.
pub const COMMIT_RETRIES: u32 = 3;
pub const COMMIT_RETRY_BACKOFF_MS: u64 = 25;

pub const MAX_LINE_LEN: usize = 64 * 1024;
pub const MAX_NOTIFICATION_BATCH: usize = 500;

/// Larger length prefixes in the WAL are treated as corruption.
pub const MAX_WAL_ENTRY_LEN: usize = 64 * 1024 * 1024;
