use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

/// Default platform commission, percent.
pub const FALLBACK_COMMISSION_RATE: Decimal = Decimal::TEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementBreakdown {
    pub total_amount: Decimal,
    pub commission_rate: Decimal,
    pub tax_rate: Decimal,
    pub platform_fee: Decimal,
    pub tax_amount: Decimal,
    pub payout_amount: Decimal,
    pub payout_floored: bool,
}

/// Split `total` into platform fee, tax and owner payout.
///
/// `commission_rate` is a percentage; `tax_rate` is a fraction of the total.
pub fn compute_settlement(
    total: Decimal,
    commission_rate: Decimal,
    tax_rate: Decimal,
) -> Result<SettlementBreakdown, EngineError> {
    if total < Decimal::ZERO {
        return Err(EngineError::InvalidAmount(total));
    }
    if commission_rate < Decimal::ZERO || commission_rate > Decimal::ONE_HUNDRED {
        return Err(EngineError::InvalidRate(commission_rate));
    }
    if tax_rate < Decimal::ZERO {
        return Err(EngineError::InvalidRate(tax_rate));
    }

    let platform_fee = round_money(total * commission_rate / Decimal::ONE_HUNDRED);
    let tax_amount = round_money(total * tax_rate);
    let raw_payout = total - platform_fee - tax_amount;
    let payout_floored = raw_payout < Decimal::ZERO;
    if payout_floored {
        metrics::counter!(crate::observability::NEGATIVE_PAYOUT_TOTAL).increment(1);
        warn!(
            %total,
            %commission_rate,
            %tax_rate,
            %raw_payout,
            "negative payout, flooring at zero"
        );
    }

    Ok(SettlementBreakdown {
        total_amount: total,
        commission_rate,
        tax_rate,
        platform_fee,
        tax_amount,
        payout_amount: raw_payout.max(Decimal::ZERO),
        payout_floored,
    })
}

impl Settlement {
    /// Exactly one of `studio_id` / `workshop_id` must be set.
    pub fn new(
        payment_id: Ulid,
        studio_id: Option<Ulid>,
        workshop_id: Option<Ulid>,
        breakdown: SettlementBreakdown,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let owner = match (studio_id, workshop_id) {
            (Some(id), None) => SettlementOwner::Studio(id),
            (None, Some(id)) => SettlementOwner::Workshop(id),
            _ => return Err(EngineError::InvalidSettlementTarget),
        };
        Ok(Self {
            id: Ulid::new(),
            payment_id,
            owner,
            total_amount: breakdown.total_amount,
            commission_rate: breakdown.commission_rate,
            tax_rate: breakdown.tax_rate,
            platform_fee: breakdown.platform_fee,
            tax_amount: breakdown.tax_amount,
            payout_amount: breakdown.payout_amount,
            payout_floored: breakdown.payout_floored,
            status: SettlementStatus::Pending,
            settled_at: None,
            audit: Audit::at(now),
        })
    }

    pub fn mark_as_paid(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.status = self.status.pay()?;
        self.settled_at = Some(now);
        self.audit.touch(now);
        Ok(())
    }

    pub fn hold(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.status = self.status.hold()?;
        self.audit.touch(now);
        Ok(())
    }

    pub fn reopen(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.status = self.status.reopen()?;
        self.audit.touch(now);
        Ok(())
    }

    /// Applies a logged status change without re-validating it.
    pub(crate) fn apply_status(&mut self, status: SettlementStatus, at: DateTime<Utc>) {
        if status == SettlementStatus::Paid {
            self.settled_at = Some(at);
        }
        self.status = status;
        self.audit.touch(at);
    }
}
