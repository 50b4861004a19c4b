/// Largest party a single reservation may bring.
pub const MAX_HEADCOUNT: u32 = 1_000;

/// Reservations kept per resource per date, cancelled ones included.
pub const MAX_RESERVATIONS_PER_DAY: usize = 2_000;

pub const MAX_REASON_LEN: usize = 1_024;

pub const MAX_PAYMENT_KEY_LEN: usize = 200;

pub const MAX_REFUND_TIERS: usize = 32;

/// Refund attempts per reservation, failed ones included.
pub const MAX_REFUND_ATTEMPTS: usize = 16;
