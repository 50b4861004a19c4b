use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use ulid::Ulid;

use crate::gateway::{RefundCallback, RefundOutcome, RefundRequest};
use crate::limits::MAX_REFUND_ATTEMPTS;
use crate::model::*;
use crate::observability;
use crate::policy::RefundPolicy;

use super::{Engine, EngineError};

/// Transaction key recorded when nothing had to be returned.
pub const NO_OP_TRANSACTION_KEY: &str = "no-op:zero-amount";

impl Engine {
    /// Events that complete `refund` and settle its side effects: the
    /// payment leaves PAID and a still-pending payout is held.
    fn completion_events(&self, refund: &Refund, transaction_key: String, at: DateTime<Utc>) -> Vec<Event> {
        let mut events = vec![Event::RefundCompleted {
            id: refund.id,
            transaction_key,
            at,
        }];
        if let Some(payment) = self.store.payment(&refund.payment_id) {
            let next = if refund.refund_amount.is_zero() {
                payment.status.cancel()
            } else {
                payment.status.refund()
            };
            if let Ok(status) = next {
                events.push(Event::PaymentStatusChanged {
                    id: payment.id,
                    status,
                    at,
                });
            }
            if let Some(settlement) = self.store.settlement_for_payment(&payment.id)
                && let Ok(status) = settlement.status.hold()
            {
                events.push(Event::SettlementStatusChanged {
                    id: settlement.id,
                    status,
                    at,
                });
            }
        }
        events
    }

    fn load_refund(&self, refund_id: &Ulid) -> Result<Refund, EngineError> {
        self.store
            .refund(refund_id)
            .ok_or(EngineError::NotFound("refund", *refund_id))
    }

    /// Send a PENDING refund to the gateway (PENDING → PROCESSING).
    /// A zero-amount refund completes without a gateway call. A gateway
    /// that refuses the request marks the refund FAILED.
    pub async fn dispatch_refund(self: &Arc<Self>, refund_id: Ulid) -> Result<RefundStatus, EngineError> {
        let gateway = self.gateway.clone().ok_or(EngineError::GatewayUnavailable)?;
        let reservation_id = self.load_refund(&refund_id)?.reservation_id;

        self.detached(move |engine| async move {
            let request = {
                let _row = engine.store.lock_record(reservation_id, engine.lock_wait).await?;
                let refund = engine.load_refund(&refund_id)?;
                refund.status.dispatch()?;
                let now = Utc::now();
                let mut events = vec![Event::RefundDispatched { id: refund_id, at: now }];

                if refund.refund_amount.is_zero() {
                    events.extend(engine.completion_events(&refund, NO_OP_TRANSACTION_KEY.into(), now));
                    engine.persist(events, None).await?;
                    metrics::counter!(observability::REFUNDS_TOTAL, "status" => "completed").increment(1);
                    info!(refund = %refund_id, "zero-amount refund completed locally");
                    return Ok(RefundStatus::Completed);
                }
                engine.persist(events, None).await?;
                RefundRequest {
                    refund_id,
                    payment_key: refund.payment_key,
                    amount: refund.refund_amount,
                }
            };

            // The record handle is released here so the gateway's callback
            // may arrive before `request_refund` returns.
            let amount = request.amount;
            match gateway.request_refund(request).await {
                Ok(()) => {
                    info!(refund = %refund_id, %amount, "refund dispatched");
                    Ok(RefundStatus::Processing)
                }
                Err(e) => {
                    warn!(refund = %refund_id, "gateway refused refund: {e}");
                    let _row = engine.store.lock_record(reservation_id, engine.lock_wait).await?;
                    let refund = engine.load_refund(&refund_id)?;
                    if refund.status.fail().is_err() {
                        // The callback beat us to it.
                        return Ok(refund.status);
                    }
                    engine
                        .persist(
                            vec![Event::RefundFailed {
                                id: refund_id,
                                reason: e.to_string(),
                                at: Utc::now(),
                            }],
                            None,
                        )
                        .await?;
                    metrics::counter!(observability::REFUNDS_TOTAL, "status" => "failed").increment(1);
                    Ok(RefundStatus::Failed)
                }
            }
        })
        .await
    }

    /// Apply the gateway's verdict to a PROCESSING refund. A refund that is
    /// already COMPLETED or FAILED is rejected untouched, so redelivery has
    /// no effect.
    pub async fn handle_refund_callback(self: &Arc<Self>, callback: RefundCallback) -> Result<Refund, EngineError> {
        let refund_id = callback.refund_id;
        let reservation_id = self.load_refund(&refund_id)?.reservation_id;

        self.detached(move |engine| async move {
            let _row = engine.store.lock_record(reservation_id, engine.lock_wait).await?;
            let refund = engine.load_refund(&refund_id)?;
            let now = Utc::now();
            let (events, label) = match callback.outcome {
                RefundOutcome::Succeeded { transaction_key } => {
                    refund.status.complete()?;
                    (engine.completion_events(&refund, transaction_key, now), "completed")
                }
                RefundOutcome::Failed { reason } => {
                    refund.status.fail()?;
                    (
                        vec![Event::RefundFailed {
                            id: refund_id,
                            reason,
                            at: now,
                        }],
                        "failed",
                    )
                }
            };
            engine.persist(events, None).await?;
            metrics::counter!(observability::REFUNDS_TOTAL, "status" => label).increment(1);
            info!(refund = %refund_id, outcome = label, "refund callback applied");
            engine.load_refund(&refund_id)
        })
        .await
    }

    /// New PENDING attempt for a cancelled reservation whose earlier
    /// attempts all FAILED. The split is recomputed as of `cancelled_at`.
    pub async fn retry_refund(self: &Arc<Self>, reservation_id: Ulid) -> Result<(Ulid, RefundInfo), EngineError> {
        self.detached(move |engine| async move {
            let _row = engine.store.lock_record(reservation_id, engine.lock_wait).await?;
            let attempts = engine.store.refunds_for_reservation(&reservation_id);
            if let Some(blocking) = attempts.iter().find(|r| r.status != RefundStatus::Failed) {
                return Err(EngineError::InvalidState {
                    entity: "refund",
                    from: blocking.status.as_str(),
                    action: "retry",
                });
            }
            if attempts.len() >= MAX_REFUND_ATTEMPTS {
                return Err(EngineError::LimitExceeded("too many refund attempts"));
            }
            let refund = engine.reissue(reservation_id)?;
            let out = (refund.id, refund.info());
            engine.persist(vec![Event::RefundRequested { refund }], None).await?;
            info!(reservation = %reservation_id, refund = %out.0, "refund reissued");
            Ok(out)
        })
        .await
    }

    /// Build a fresh PENDING refund for a cancelled, paid reservation.
    fn reissue(&self, reservation_id: Ulid) -> Result<Refund, EngineError> {
        let reservation = self
            .store
            .reservation(&reservation_id)
            .ok_or(EngineError::NotFound("reservation", reservation_id))?;
        let cancelled_at = match (reservation.status, reservation.cancelled_at) {
            (ReservationStatus::Cancelled, Some(at)) => at,
            (status, _) => {
                return Err(EngineError::InvalidState {
                    entity: "reservation",
                    from: status.as_str(),
                    action: "refund",
                });
            }
        };
        let payment = self
            .store
            .payment_for_reservation(&reservation_id)
            .ok_or(EngineError::NotFound("payment", reservation_id))?;
        if payment.status != PaymentStatus::Paid {
            return Err(EngineError::InvalidState {
                entity: "payment",
                from: payment.status.as_str(),
                action: "refund",
            });
        }
        let policy = RefundPolicy::from_config(&self.settings, reservation.resource_kind);
        let info = policy.compute(payment.amount, reservation.starts_at(), cancelled_at)?;
        let reason = reservation.cancel_reason.unwrap_or_default();
        Ok(Refund::pending(&payment, info, reason, Utc::now()))
    }

    /// Re-issue refunds lost between a cancellation and its refund row
    /// (torn WAL tail). Returns the new refund ids.
    pub async fn recover_missing_refunds(self: &Arc<Self>) -> Result<Vec<Ulid>, EngineError> {
        let candidates = self.store.reservations_where(|r| r.status == ReservationStatus::Cancelled);
        let mut recovered = Vec::new();
        for reservation in candidates {
            let reservation_id = reservation.id;
            let reissued = self
                .detached(move |engine| async move {
                    let _row = engine.store.lock_record(reservation_id, engine.lock_wait).await?;
                    let paid = engine
                        .store
                        .payment_for_reservation(&reservation_id)
                        .is_some_and(|p| p.status == PaymentStatus::Paid);
                    if !paid || !engine.store.refunds_for_reservation(&reservation_id).is_empty() {
                        return Ok(None);
                    }
                    let refund = engine.reissue(reservation_id)?;
                    let id = refund.id;
                    engine.persist(vec![Event::RefundRequested { refund }], None).await?;
                    Ok(Some(id))
                })
                .await?;
            if let Some(id) = reissued {
                warn!(reservation = %reservation_id, refund = %id, "recovered missing refund");
                metrics::counter!(observability::REFUNDS_RECOVERED_TOTAL).increment(1);
                recovered.push(id);
            }
        }
        Ok(recovered)
    }
}
