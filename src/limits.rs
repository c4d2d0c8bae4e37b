// Input bounds. Anything outside these is a validation error, not a crash.

pub const MAX_USER_ID_LEN: usize = 50;
pub const MAX_NOTES_LEN: usize = 500;

/// Upper bound a caller may request for `max_retries`.
pub const MAX_RETRIES_CEILING: u32 = 10;

pub const DEFAULT_WINDOW_DAYS: u32 = 10;
pub const MAX_WINDOW_DAYS: u32 = 366;

pub const DEFAULT_JOB_MAX_RETRIES: u32 = 3;

/// Page size for status queries issued by the sweeps.
pub const SWEEP_BATCH: usize = 500;

pub const MAX_USER_REQUESTS_PAGE: usize = 100;
