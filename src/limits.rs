use crate::model::{DAY_MS, Ms};

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_PROVIDERS_PER_TENANT: usize = 100_000;
pub const MAX_BREAKS_PER_PROVIDER: usize = 10_000;
pub const MAX_BOOKINGS_PER_PROVIDER: usize = 100_000;
pub const MAX_WAITING_LIST_PER_PROVIDER: usize = 10_000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 500;

pub const MIN_SERVICE_MINUTES: u32 = 10;
pub const MAX_SERVICE_MINUTES: u32 = 240;
pub const MIN_BUFFER_MINUTES: u32 = 0;
pub const MAX_BUFFER_MINUTES: u32 = 60;
pub const MIN_DAILY_BOOKINGS: u32 = 1;
pub const MAX_DAILY_BOOKINGS: u32 = 100;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// Breaks longer than this are almost certainly input errors.
pub const MAX_BREAK_DURATION_MS: Ms = 366 * DAY_MS;

/// Attempts at drawing an unused confirmation code before giving up.
pub const MAX_CODE_ATTEMPTS: usize = 16;
