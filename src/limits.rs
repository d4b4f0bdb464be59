use crate::model::Ms;

pub const MAX_VEHICLES: usize = 10_000;
pub const MAX_TEXT_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4_096;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
