use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::settings;
use crate::settlement::{FALLBACK_COMMISSION_RATE, compute_settlement};

use super::{Engine, EngineError};

impl Engine {
    /// Commission for the resource owner: its rate card, else the
    /// configured default, else 10%.
    pub(super) fn commission_rate_for(&self, resource_id: &Ulid) -> Decimal {
        self.pricing
            .rates(resource_id)
            .and_then(|r| r.commission_rate)
            .unwrap_or_else(|| {
                self.settings
                    .get_decimal(settings::DEFAULT_COMMISSION_RATE, FALLBACK_COMMISSION_RATE)
            })
    }

    /// Build, but do not persist, the settlement for a paid payment.
    pub(super) fn draft_settlement(
        &self,
        payment: &Payment,
        reservation: &Reservation,
    ) -> Result<Settlement, EngineError> {
        if payment.status != PaymentStatus::Paid {
            return Err(EngineError::InvalidState {
                entity: "payment",
                from: payment.status.as_str(),
                action: "settle",
            });
        }
        let commission = self.commission_rate_for(&reservation.resource_id);
        let tax_rate = self.settings.get_decimal(settings::TAX_RATE, Decimal::ZERO);
        let breakdown = compute_settlement(payment.amount, commission, tax_rate)?;

        let (studio_id, workshop_id) = match reservation.resource_kind {
            ResourceKind::Studio => (Some(reservation.resource_id), None),
            ResourceKind::Workshop => (None, Some(reservation.resource_id)),
        };
        Settlement::new(payment.id, studio_id, workshop_id, breakdown, Utc::now())
    }

    /// Caller holds the reservation's record handle.
    pub(super) async fn settle_locked(&self, payment: &Payment) -> Result<Settlement, EngineError> {
        if let Some(existing) = self.store.settlement_for_payment(&payment.id) {
            return Ok(existing);
        }
        let reservation = self
            .store
            .reservation(&payment.reservation_id)
            .ok_or(EngineError::NotFound("reservation", payment.reservation_id))?;
        let settlement = self.draft_settlement(payment, &reservation)?;
        self.persist(
            vec![Event::SettlementCreated {
                settlement: settlement.clone(),
            }],
            None,
        )
        .await?;
        metrics::counter!(observability::SETTLEMENTS_TOTAL).increment(1);
        info!(
            payment = %payment.id,
            settlement = %settlement.id,
            payout = %settlement.payout_amount,
            "settlement created"
        );
        Ok(settlement)
    }

    /// Derive the settlement for a paid payment. Returns the existing one
    /// if the payment was already settled.
    pub async fn settle(self: &Arc<Self>, payment_id: Ulid) -> Result<Settlement, EngineError> {
        let payment = self
            .store
            .payment(&payment_id)
            .ok_or(EngineError::NotFound("payment", payment_id))?;
        self.detached(move |engine| async move {
            let _row = engine.store.lock_record(payment.reservation_id, engine.lock_wait).await?;
            let payment = engine
                .store
                .payment(&payment_id)
                .ok_or(EngineError::NotFound("payment", payment_id))?;
            engine.settle_locked(&payment).await
        })
        .await
    }

    pub async fn mark_settlement_paid(self: &Arc<Self>, settlement_id: Ulid) -> Result<Settlement, EngineError> {
        self.transition_settlement(settlement_id, SettlementStatus::pay).await
    }

    /// Administrative hold (CANCELLED).
    pub async fn hold_settlement(self: &Arc<Self>, settlement_id: Ulid) -> Result<Settlement, EngineError> {
        self.transition_settlement(settlement_id, SettlementStatus::hold).await
    }

    /// Lift a hold, back to PENDING.
    pub async fn reopen_settlement(self: &Arc<Self>, settlement_id: Ulid) -> Result<Settlement, EngineError> {
        self.transition_settlement(settlement_id, SettlementStatus::reopen).await
    }

    async fn transition_settlement(
        self: &Arc<Self>,
        settlement_id: Ulid,
        step: fn(SettlementStatus) -> Result<SettlementStatus, InvalidTransition>,
    ) -> Result<Settlement, EngineError> {
        let settlement = self
            .store
            .settlement(&settlement_id)
            .ok_or(EngineError::NotFound("settlement", settlement_id))?;
        let payment = self
            .store
            .payment(&settlement.payment_id)
            .ok_or(EngineError::NotFound("payment", settlement.payment_id))?;

        self.detached(move |engine| async move {
            let _row = engine.store.lock_record(payment.reservation_id, engine.lock_wait).await?;
            let current = engine
                .store
                .settlement(&settlement_id)
                .ok_or(EngineError::NotFound("settlement", settlement_id))?;
            let status = step(current.status)?;
            engine
                .persist(
                    vec![Event::SettlementStatusChanged {
                        id: settlement_id,
                        status,
                        at: Utc::now(),
                    }],
                    None,
                )
                .await?;
            info!(settlement = %settlement_id, status = status.as_str(), "settlement updated");
            engine
                .store
                .settlement(&settlement_id)
                .ok_or(EngineError::NotFound("settlement", settlement_id))
        })
        .await
    }
}
