//! Operational bounds enforced at the mutation boundary.

/// Max seats on a single slot.
pub const MAX_SLOT_CAPACITY: u32 = 100;

/// Max slots a single provider may hold.
pub const MAX_SLOTS_PER_PROVIDER: usize = 10_000;

/// Max service line items on one appointment.
pub const MAX_SERVICES_PER_APPOINTMENT: usize = 50;

/// Max quantity per service line item.
pub const MAX_SERVICE_QUANTITY: u32 = 500;

/// Max days a bulk generation run may cover.
pub const MAX_BULK_RANGE_DAYS: i64 = 92;

/// Max days an availability or stats query may cover.
pub const MAX_QUERY_RANGE_DAYS: i64 = 366;

/// Max length of provider/service names.
pub const MAX_NAME_LEN: usize = 256;

/// Max length of free-text reasons and notes.
pub const MAX_REASON_LEN: usize = 1_024;

/// Attempts at generating an unused appointment number before giving up.
pub const MAX_NUMBER_ATTEMPTS: usize = 16;
