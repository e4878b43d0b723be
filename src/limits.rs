use crate::model::Ms;

// ── Per-tenant capacity ──────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_SLOTS_PER_TENANT: usize = 1_000_000;
pub const MAX_SWAPS_PER_TENANT: usize = 1_000_000;

// ── Field sizes ──────────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 512;

// ── Time bounds ──────────────────────────────────────────────────

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single slot may not cover more than 31 days.
pub const MAX_SLOT_DURATION_MS: Ms = 31 * 24 * 3_600_000;
