use crate::model::Ms;

// ── Tenants ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Entity counts ────────────────────────────────────────────────

pub const MAX_PLANS_PER_TENANT: usize = 10_000;
pub const MAX_SCHEDULES_PER_PLAN: usize = 5_000;
/// Upper bound on a single session's capacity.
pub const MAX_SCHEDULE_CAPACITY: u32 = 10_000;
/// Upper bound on any single target count of a plan.
pub const MAX_TARGET_COUNT: u32 = 1_000_000;

// ── Text fields ──────────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_WORKER_REF_LEN: usize = 128;
pub const MAX_CONTACT_FIELD_LEN: usize = 256;

// ── Time ─────────────────────────────────────────────────────────

pub const MIN_PLAN_YEAR: i32 = 2000;
pub const MAX_PLAN_YEAR: i32 = 2100;
/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2101-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_133_980_800_000;
/// An examination session never spans more than a day.
pub const MAX_SESSION_DURATION_MS: Ms = 24 * 3_600_000;

// ── Misc ─────────────────────────────────────────────────────────

/// Attempts at minting a reservation number before giving up.
pub const MAX_NUMBER_ATTEMPTS: usize = 8;
pub const MAX_EXAM_TYPES_LEN: usize = 256;
