use chrono::NaiveTime;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::InvalidTransition;

#[derive(Debug)]
pub enum EngineError {
    InvalidInterval {
        start: NaiveTime,
        end: NaiveTime,
    },
    /// Candidate overlaps this existing reservation.
    SlotConflict(Ulid),
    NotFound(&'static str, Ulid),
    InvalidState {
        entity: &'static str,
        from: &'static str,
        action: &'static str,
    },
    LockTimeout(Ulid),
    AlreadyExists(Ulid),
    CapacityExceeded(u32),
    InvalidAmount(Decimal),
    InvalidRate(Decimal),
    InvalidSettlementTarget,
    InvariantViolation(&'static str),
    GatewayUnavailable,
    LimitExceeded(&'static str),
    WalError(String),
    Internal(String),
}

impl EngineError {
    /// The caller may retry the same request, or a nearby one, and succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SlotConflict(_) | EngineError::LockTimeout(_))
    }
}

impl From<InvalidTransition> for EngineError {
    fn from(t: InvalidTransition) -> Self {
        EngineError::InvalidState {
            entity: t.entity,
            from: t.from,
            action: t.action,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::SlotConflict(id) => write!(f, "slot conflicts with reservation: {id}"),
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::InvalidState { entity, from, action } => {
                write!(f, "cannot {action} {entity} in state {from}")
            }
            EngineError::LockTimeout(id) => write!(f, "timed out waiting for lock on {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::CapacityExceeded(cap) => write!(f, "headcount exceeds capacity {cap}"),
            EngineError::InvalidAmount(amount) => write!(f, "invalid amount: {amount}"),
            EngineError::InvalidRate(rate) => write!(f, "invalid rate: {rate}"),
            EngineError::InvalidSettlementTarget => {
                write!(f, "settlement must target exactly one of studio or workshop")
            }
            EngineError::InvariantViolation(msg) => write!(f, "invariant violated: {msg}"),
            EngineError::GatewayUnavailable => write!(f, "no payment gateway configured"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
