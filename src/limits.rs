use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Slots starting sooner than this after "now" are never offered.
pub const DEFAULT_MIN_NOTICE_MS: Ms = 24 * HOUR_MS;
/// Slots starting later than this after "now" are never offered.
pub const DEFAULT_MAX_ADVANCE_MS: Ms = 30 * DAY_MS;

pub const MAX_PROFESSIONALS: usize = 100_000;
pub const MAX_RECORDS_PER_PROFESSIONAL: usize = 50_000;
pub const MAX_EXCEPTIONS: usize = 1_000;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_SERVICE_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

pub const MAX_SLOT_DURATION_MINUTES: i64 = 24 * 60;
pub const MAX_BUFFER_MINUTES: i64 = 24 * 60;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
