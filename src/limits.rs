use crate::model::Ms;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest single reservation.
pub const MAX_RESERVATION_MS: Ms = DAY_MS;
/// Widest calendar window a query or candidate fetch may cover.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ACCOUNT_LEN: usize = 128;
pub const MAX_NOTE_LEN: usize = 1024;
pub const MAX_DEPARTMENT_NAME_LEN: usize = 128;
pub const MAX_DEPARTMENTS: usize = 4096;
pub const MAX_RESOURCES_PER_DEPARTMENT: usize = 10_000;
