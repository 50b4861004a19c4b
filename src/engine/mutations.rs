use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::policy::RefundPolicy;
use crate::settings;

use super::conflict::{candidate_span, find_conflict};
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub resource_id: Ulid,
    pub customer_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub headcount: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub reservation_id: Ulid,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub settlement: Settlement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub reservation_id: Ulid,
    /// Absent when the reservation was never paid.
    pub refund: Option<(Ulid, RefundInfo)>,
}

impl Engine {
    /// Reserve `[start_time, end_time)` on the resource. The overlap check
    /// and the insert run under the resource's exclusive handle.
    pub async fn book(self: &Arc<Self>, request: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let span = candidate_span(request.date, request.start_time, request.end_time)?;
        if request.headcount == 0 {
            return Err(EngineError::LimitExceeded("headcount must be at least 1"));
        }
        if request.headcount > MAX_HEADCOUNT {
            return Err(EngineError::LimitExceeded("headcount too large"));
        }
        let rates = self
            .pricing
            .rates(&request.resource_id)
            .ok_or(EngineError::NotFound("resource", request.resource_id))?;
        let capacity = match rates.capacity {
            Some(cap) => cap,
            None => {
                let cap = self.settings.get_int(settings::DEFAULT_CAPACITY, i64::from(MAX_HEADCOUNT));
                u32::try_from(cap).unwrap_or(MAX_HEADCOUNT)
            }
        };
        if request.headcount > capacity {
            return Err(EngineError::CapacityExceeded(capacity));
        }
        let total_amount = rates.quote(span.duration_ms(), request.headcount);

        let result = self
            .detached(move |engine| async move {
                let wait_start = Instant::now();
                let mut handle = engine
                    .store
                    .lock_resource(request.resource_id, engine.lock_wait)
                    .await?;
                metrics::histogram!(observability::BOOKING_LOCK_WAIT_SECONDS)
                    .record(wait_start.elapsed().as_secs_f64());

                engine.store.prune_cancelled(&mut handle, request.date);
                let occupying = engine.store.occupying(&handle, request.date);
                if let Some(existing) = find_conflict(&occupying, &span) {
                    return Err(EngineError::SlotConflict(existing));
                }
                if occupying.len() >= MAX_RESERVATIONS_PER_DAY {
                    return Err(EngineError::LimitExceeded("too many reservations on date"));
                }

                let now = Utc::now();
                let reservation = Reservation {
                    id: Ulid::new(),
                    resource_id: request.resource_id,
                    resource_kind: rates.kind,
                    customer_id: request.customer_id,
                    date: request.date,
                    start_time: request.start_time,
                    end_time: request.end_time,
                    headcount: request.headcount,
                    total_amount,
                    status: ReservationStatus::Pending,
                    cancel_reason: None,
                    cancelled_at: None,
                    audit: Audit::at(now),
                };
                let reservation_id = reservation.id;
                engine
                    .persist(vec![Event::ReservationBooked { reservation }], Some(&mut *handle))
                    .await?;
                Ok(BookingReceipt {
                    reservation_id,
                    total_amount,
                })
            })
            .await;

        let label = observability::outcome_label(&result);
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => label).increment(1);
        match &result {
            Ok(receipt) => info!(
                reservation = %receipt.reservation_id,
                resource = %request.resource_id,
                date = %request.date,
                "booked {}-{}", request.start_time, request.end_time
            ),
            Err(e) => debug!(resource = %request.resource_id, "booking rejected: {e}"),
        }
        result
    }

    /// Record a successful charge. Idempotent by `payment_key`: a repeat
    /// returns the original payment and its settlement.
    pub async fn record_payment(
        self: &Arc<Self>,
        reservation_id: Ulid,
        amount: Decimal,
        method: PaymentMethod,
        payment_key: String,
    ) -> Result<PaymentReceipt, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount(amount));
        }
        if payment_key.is_empty() || payment_key.len() > MAX_PAYMENT_KEY_LEN {
            return Err(EngineError::LimitExceeded("payment key length"));
        }

        self.detached(move |engine| async move {
            let _row = engine.store.lock_record(reservation_id, engine.lock_wait).await?;

            if let Some(existing) = engine.store.payment_by_key(&payment_key) {
                if existing.reservation_id != reservation_id {
                    return Err(EngineError::AlreadyExists(existing.id));
                }
                let settlement = match engine.store.settlement_for_payment(&existing.id) {
                    Some(s) => s,
                    None => engine.settle_locked(&existing).await?,
                };
                return Ok(PaymentReceipt {
                    payment: existing,
                    settlement,
                });
            }

            // Claimed across reservations so two concurrent charges cannot
            // share a key.
            if let Err(holder) = engine.store.claim_payment_key(&payment_key, reservation_id) {
                let id = engine.store.payment_by_key(&payment_key).map_or(holder, |p| p.id);
                return Err(EngineError::AlreadyExists(id));
            }
            let key = payment_key.clone();
            let result = engine.pay_locked(reservation_id, amount, method, payment_key).await;
            if result.is_err() {
                engine.store.release_payment_key(&key, reservation_id);
            }
            result
        })
        .await
    }

    /// Caller holds the reservation's record handle and the key claim.
    async fn pay_locked(
        &self,
        reservation_id: Ulid,
        amount: Decimal,
        method: PaymentMethod,
        payment_key: String,
    ) -> Result<PaymentReceipt, EngineError> {
        let reservation = self
            .store
            .reservation(&reservation_id)
            .ok_or(EngineError::NotFound("reservation", reservation_id))?;
        if let Some(prior) = self.store.payment_for_reservation(&reservation_id) {
            return Err(EngineError::AlreadyExists(prior.id));
        }
        if !matches!(
            reservation.status,
            ReservationStatus::Pending | ReservationStatus::Confirmed
        ) {
            return Err(EngineError::InvalidState {
                entity: "reservation",
                from: reservation.status.as_str(),
                action: "pay",
            });
        }
        if amount != reservation.total_amount {
            warn!(
                reservation = %reservation_id,
                %amount,
                quoted = %reservation.total_amount,
                "payment amount differs from quote"
            );
        }

        let now = Utc::now();
        let payment = Payment {
            id: Ulid::new(),
            reservation_id,
            amount,
            method,
            payment_key,
            status: PaymentStatus::Paid,
            paid_at: now,
            audit: Audit::at(now),
        };
        let settlement = self.draft_settlement(&payment, &reservation)?;

        let mut events = vec![Event::PaymentRecorded {
            payment: payment.clone(),
        }];
        if reservation.status == ReservationStatus::Pending {
            reservation.status.confirm()?;
            events.push(Event::ReservationConfirmed {
                id: reservation_id,
                at: now,
            });
        }
        events.push(Event::SettlementCreated {
            settlement: settlement.clone(),
        });
        self.persist(events, None).await?;
        metrics::counter!(observability::SETTLEMENTS_TOTAL).increment(1);
        info!(
            reservation = %reservation_id,
            payment = %payment.id,
            settlement = %settlement.id,
            "payment recorded"
        );
        Ok(PaymentReceipt {
            payment,
            settlement,
        })
    }

    pub async fn confirm(self: &Arc<Self>, reservation_id: Ulid) -> Result<(), EngineError> {
        self.transition_reservation(reservation_id, |status, id, at| {
            status.confirm()?;
            Ok(Event::ReservationConfirmed { id, at })
        })
        .await
    }

    pub async fn complete(self: &Arc<Self>, reservation_id: Ulid) -> Result<(), EngineError> {
        self.transition_reservation(reservation_id, |status, id, at| {
            status.complete()?;
            Ok(Event::ReservationCompleted { id, at })
        })
        .await
    }

    async fn transition_reservation<F>(self: &Arc<Self>, reservation_id: Ulid, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(ReservationStatus, Ulid, chrono::DateTime<Utc>) -> Result<Event, EngineError> + Send + 'static,
    {
        self.detached(move |engine| async move {
            let _row = engine.store.lock_record(reservation_id, engine.lock_wait).await?;
            let reservation = engine
                .store
                .reservation(&reservation_id)
                .ok_or(EngineError::NotFound("reservation", reservation_id))?;
            let event = f(reservation.status, reservation_id, Utc::now())?;
            engine.persist(vec![event], None).await
        })
        .await
    }

    /// Cancel a PENDING or CONFIRMED reservation. A paid reservation gets a
    /// PENDING refund written in the same commit as the cancellation.
    pub async fn cancel(
        self: &Arc<Self>,
        reservation_id: Ulid,
        reason: String,
        now: NaiveDateTime,
    ) -> Result<CancelOutcome, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }

        let outcome = self
            .detached(move |engine| async move {
                let _row = engine.store.lock_record(reservation_id, engine.lock_wait).await?;
                let reservation = engine
                    .store
                    .reservation(&reservation_id)
                    .ok_or(EngineError::NotFound("reservation", reservation_id))?;
                reservation.status.cancel()?;

                let stamp = Utc::now();
                let mut events = vec![Event::ReservationCancelled {
                    id: reservation_id,
                    reason: reason.clone(),
                    cancelled_at: now,
                    at: stamp,
                }];

                let mut refund_out = None;
                let payment = engine
                    .store
                    .payment_for_reservation(&reservation_id)
                    .filter(|p| p.status == PaymentStatus::Paid);
                if let Some(payment) = payment {
                    let policy = RefundPolicy::from_config(&engine.settings, reservation.resource_kind);
                    let info = policy.compute(payment.amount, reservation.starts_at(), now)?;
                    let refund = Refund::pending(&payment, info.clone(), reason, stamp);
                    refund_out = Some((refund.id, info));
                    events.push(Event::RefundRequested { refund });
                }

                engine.persist(events, None).await?;
                Ok(CancelOutcome {
                    reservation_id,
                    refund: refund_out,
                })
            })
            .await?;

        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
        match &outcome.refund {
            Some((refund_id, info)) => info!(
                reservation = %reservation_id,
                refund = %refund_id,
                refund_amount = %info.refund_amount,
                fee = %info.cancellation_fee,
                policy = %info.policy_label,
                "reservation cancelled"
            ),
            None => info!(reservation = %reservation_id, "unpaid reservation cancelled"),
        }
        Ok(outcome)
    }
}
