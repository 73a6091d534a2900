//! Hard limits that keep a single process bounded.

pub const MAX_MEMBERS: usize = 100_000;
pub const MAX_USERS: usize = 10_000;
pub const MAX_PLANS: usize = 1_000;
pub const MAX_COURTS: usize = 1_000;
pub const MAX_CLASSES: usize = 200_000;
pub const MAX_ROUTINE_TEMPLATES: usize = 1_000;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_NATIONAL_ID_LEN: usize = 12;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_DESCRIPTION_LEN: usize = 2_000;
/// Routine bodies, templates included.
pub const MAX_CONTENT_LEN: usize = 20_000;

pub const MAX_SUBSCRIPTIONS_PER_MEMBER: usize = 1_000;
pub const MAX_PAYMENTS_PER_MEMBER: usize = 5_000;
pub const MAX_ROUTINES_PER_MEMBER: usize = 1_000;
pub const MAX_BOOKINGS_PER_COURT: usize = 500_000;
pub const MAX_CLASS_CAPACITY: u32 = 10_000;
pub const MAX_PLAN_DURATION_DAYS: u32 = 3_660;

pub const MAX_WEIGHT_GRAMS: u32 = 400_000;
pub const MIN_HEIGHT_CM: u32 = 50;
pub const MAX_HEIGHT_CM: u32 = 260;

/// Widest date range accepted by calendar queries and recurring class generation.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Longest accepted request line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Resources one connection may watch at a time.
pub const MAX_WATCHES_PER_CONNECTION: usize = 64;
