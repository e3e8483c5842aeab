//! Hard resource limits. These are denial-of-service guards, not business
//! rules; crossing one yields `EngineError::LimitExceeded`.

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_ITEMS_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_ITEM: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 1_000;

/// Accepted timestamp range. Anything outside is a client bug or an attack,
/// not a real booking window.
pub const MIN_VALID_TIMESTAMP_MS: i64 = 0;
/// 2200-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: i64 = 7_258_118_400_000;

/// One year. Nobody borrows a ladder for longer.
pub const MAX_SPAN_DURATION_MS: i64 = 31_536_000_000;
