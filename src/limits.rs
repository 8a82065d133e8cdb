use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 9999-12-31T23:59:59Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_000;

pub const MIN_DURATION_MINUTES: u32 = 15;
pub const MAX_DURATION_MINUTES: u32 = 8 * 60;

pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_COMMENT_LEN: usize = 2_000;
pub const MAX_CONTACT_LEN: usize = 254;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// Upper bound on a single WAL record; anything larger is treated as corruption.
pub const MAX_RECORD_BYTES: usize = 1 << 20;
