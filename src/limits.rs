use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_OCCUPANTS: usize = 256;
pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_TOKEN_LEN: usize = 1024;
pub const MAX_STATUS_LEN: usize = 64;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_MESSAGE_LEN: usize = 4096;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;
pub const MAX_PENDING_NOTIFICATIONS: usize = 1_000_000;

/// Largest WAL record payload accepted on write or replay.
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;
