use crate::model::{DAY, HOUR, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_QUERY_WINDOW_DAYS: i64 = 62;
pub const MAX_SERVICES_PER_BOOKING: usize = 10;
pub const MAX_ADD_ONS_PER_BOOKING: usize = 10;
pub const MAX_BOOKING_DURATION_MS: Ms = 24 * HOUR;
pub const MAX_RULES_PER_PROVIDER: usize = 256;
pub const MAX_OVERRIDES_PER_PROVIDER: usize = 256;
pub const MAX_EVENTS_PER_PROVIDER: usize = 256;
pub const MAX_BREAKS_PER_RULE: usize = 16;
pub const MAX_CUSTOM_HOURS_PER_OVERRIDE: usize = 16;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2000;
pub const MAX_SERIES_OCCURRENCES: usize = 104;
pub const MAX_RECURRENCE_INTERVAL: u32 = 52;
pub const MAX_BUFFER_MINUTES: u32 = 240;
pub const MAX_PACKAGE_SESSIONS: u32 = 1000;
pub const MAX_CALENDAR_EVENT_SPAN_MS: Ms = 366 * DAY;
