use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds on the studio's local wall clock.
pub type Ms = i64;

/// Round to currency precision (2 dp, half-up).
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span covering `[date+start, date+end)`.
    pub fn on_date(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self::new(wall_ms(date.and_time(start)), wall_ms(date.and_time(end)))
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

fn wall_ms(at: NaiveDateTime) -> Ms {
    at.and_utc().timestamp_millis()
}

/// Creation/modification stamps carried by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Audit {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// A status change the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: &'static str,
    pub action: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Studio,
    Workshop,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Studio => "studio",
            ResourceKind::Workshop => "workshop",
        }
    }
}

// ── Reservation ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    /// Counts toward slot-overlap conflicts.
    pub fn is_occupying(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationStatus::Completed | ReservationStatus::Cancelled)
    }

    pub fn confirm(self) -> Result<Self, InvalidTransition> {
        match self {
            ReservationStatus::Pending => Ok(ReservationStatus::Confirmed),
            other => Err(other.reject("confirm")),
        }
    }

    pub fn complete(self) -> Result<Self, InvalidTransition> {
        match self {
            ReservationStatus::Confirmed => Ok(ReservationStatus::Completed),
            other => Err(other.reject("complete")),
        }
    }

    pub fn cancel(self) -> Result<Self, InvalidTransition> {
        match self {
            ReservationStatus::Pending | ReservationStatus::Confirmed => Ok(ReservationStatus::Cancelled),
            other => Err(other.reject("cancel")),
        }
    }

    fn reject(self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            entity: "reservation",
            from: self.as_str(),
            action,
        }
    }
}

/// One customer's claim on a resource for `[start_time, end_time)` on `date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub resource_kind: ResourceKind,
    pub customer_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub headcount: u32,
    pub total_amount: Decimal,
    pub status: ReservationStatus,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<NaiveDateTime>,
    pub audit: Audit,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::on_date(self.date, self.start_time, self.end_time)
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }
}

// ── Payment ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Card,
    BankTransfer,
    EasyPay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Paid,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }

    pub fn refund(self) -> Result<Self, InvalidTransition> {
        match self {
            PaymentStatus::Paid => Ok(PaymentStatus::Refunded),
            other => Err(other.reject("refund")),
        }
    }

    pub fn cancel(self) -> Result<Self, InvalidTransition> {
        match self {
            PaymentStatus::Paid => Ok(PaymentStatus::Cancelled),
            other => Err(other.reject("cancel")),
        }
    }

    fn reject(self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            entity: "payment",
            from: self.as_str(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    /// Gateway correlation key, unique across payments.
    pub payment_key: String,
    pub status: PaymentStatus,
    pub paid_at: DateTime<Utc>,
    pub audit: Audit,
}

// ── Refund ───────────────────────────────────────────────────────

/// Fee/refund split for one cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundInfo {
    pub original_amount: Decimal,
    pub cancellation_fee: Decimal,
    pub refund_amount: Decimal,
    pub policy_label: String,
}

impl RefundInfo {
    /// Builds the split from a refund amount; the fee is whatever remains.
    pub fn new(
        original_amount: Decimal,
        refund_amount: Decimal,
        policy_label: String,
    ) -> Option<Self> {
        if refund_amount < Decimal::ZERO || refund_amount > original_amount {
            return None;
        }
        Some(Self {
            original_amount,
            cancellation_fee: original_amount - refund_amount,
            refund_amount,
            policy_label,
        })
    }

    pub fn is_full_refund(&self) -> bool {
        self.refund_amount == self.original_amount
    }

    pub fn is_partial_refund(&self) -> bool {
        self.refund_amount > Decimal::ZERO && self.refund_amount < self.original_amount
    }

    /// Percentage of the original amount returned, 4 dp.
    pub fn refund_rate(&self) -> Decimal {
        if self.original_amount.is_zero() {
            return Decimal::ZERO;
        }
        (self.refund_amount / self.original_amount * Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefundStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Processing => "PROCESSING",
            RefundStatus::Completed => "COMPLETED",
            RefundStatus::Failed => "FAILED",
        }
    }

    /// Pending or in flight at the gateway.
    pub fn is_live(&self) -> bool {
        matches!(self, RefundStatus::Pending | RefundStatus::Processing)
    }

    pub fn dispatch(self) -> Result<Self, InvalidTransition> {
        match self {
            RefundStatus::Pending => Ok(RefundStatus::Processing),
            other => Err(other.reject("dispatch")),
        }
    }

    pub fn complete(self) -> Result<Self, InvalidTransition> {
        match self {
            RefundStatus::Processing => Ok(RefundStatus::Completed),
            other => Err(other.reject("complete")),
        }
    }

    pub fn fail(self) -> Result<Self, InvalidTransition> {
        match self {
            RefundStatus::Processing => Ok(RefundStatus::Failed),
            other => Err(other.reject("fail")),
        }
    }

    fn reject(self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            entity: "refund",
            from: self.as_str(),
            action,
        }
    }
}

/// One refund attempt. Only the status fields ever change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: Ulid,
    pub payment_id: Ulid,
    pub reservation_id: Ulid,
    pub original_amount: Decimal,
    pub cancellation_fee: Decimal,
    pub refund_amount: Decimal,
    pub reason: String,
    pub policy_label: String,
    pub status: RefundStatus,
    pub payment_key: String,
    pub transaction_key: Option<String>,
    pub failure_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub audit: Audit,
}

impl Refund {
    pub fn pending(payment: &Payment, info: RefundInfo, reason: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new(),
            payment_id: payment.id,
            reservation_id: payment.reservation_id,
            original_amount: info.original_amount,
            cancellation_fee: info.cancellation_fee,
            refund_amount: info.refund_amount,
            reason,
            policy_label: info.policy_label,
            status: RefundStatus::Pending,
            payment_key: payment.payment_key.clone(),
            transaction_key: None,
            failure_reason: None,
            requested_at: now,
            refunded_at: None,
            audit: Audit::at(now),
        }
    }

    pub fn info(&self) -> RefundInfo {
        RefundInfo {
            original_amount: self.original_amount,
            cancellation_fee: self.cancellation_fee,
            refund_amount: self.refund_amount,
            policy_label: self.policy_label.clone(),
        }
    }
}

// ── Settlement ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementOwner {
    Studio(Ulid),
    Workshop(Ulid),
}

impl SettlementOwner {
    pub fn id(&self) -> Ulid {
        match self {
            SettlementOwner::Studio(id) | SettlementOwner::Workshop(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementStatus {
    Pending,
    Paid,
    /// Administrative hold.
    Cancelled,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Paid => "PAID",
            SettlementStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn pay(self) -> Result<Self, InvalidTransition> {
        match self {
            SettlementStatus::Pending => Ok(SettlementStatus::Paid),
            other => Err(other.reject("mark as paid")),
        }
    }

    pub fn hold(self) -> Result<Self, InvalidTransition> {
        match self {
            SettlementStatus::Pending => Ok(SettlementStatus::Cancelled),
            other => Err(other.reject("hold")),
        }
    }

    pub fn reopen(self) -> Result<Self, InvalidTransition> {
        match self {
            SettlementStatus::Cancelled => Ok(SettlementStatus::Pending),
            other => Err(other.reject("reopen")),
        }
    }

    fn reject(self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            entity: "settlement",
            from: self.as_str(),
            action,
        }
    }
}

/// Payout computation for one payment. See `crate::settlement` for construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Ulid,
    pub payment_id: Ulid,
    pub owner: SettlementOwner,
    pub total_amount: Decimal,
    pub commission_rate: Decimal,
    pub tax_rate: Decimal,
    pub platform_fee: Decimal,
    pub tax_amount: Decimal,
    pub payout_amount: Decimal,
    /// Raw payout was negative and clamped to zero.
    pub payout_floored: bool,
    pub status: SettlementStatus,
    pub settled_at: Option<DateTime<Utc>>,
    pub audit: Audit,
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationBooked {
        reservation: Reservation,
    },
    ReservationConfirmed {
        id: Ulid,
        at: DateTime<Utc>,
    },
    ReservationCompleted {
        id: Ulid,
        at: DateTime<Utc>,
    },
    ReservationCancelled {
        id: Ulid,
        reason: String,
        cancelled_at: NaiveDateTime,
        at: DateTime<Utc>,
    },
    PaymentRecorded {
        payment: Payment,
    },
    PaymentStatusChanged {
        id: Ulid,
        status: PaymentStatus,
        at: DateTime<Utc>,
    },
    RefundRequested {
        refund: Refund,
    },
    RefundDispatched {
        id: Ulid,
        at: DateTime<Utc>,
    },
    RefundCompleted {
        id: Ulid,
        transaction_key: String,
        at: DateTime<Utc>,
    },
    RefundFailed {
        id: Ulid,
        reason: String,
        at: DateTime<Utc>,
    },
    SettlementCreated {
        settlement: Settlement,
    },
    SettlementStatusChanged {
        id: Ulid,
        status: SettlementStatus,
        at: DateTime<Utc>,
    },
}
