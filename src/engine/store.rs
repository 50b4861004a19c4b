use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;
use super::conflict::Slot;

/// Reservation ids on one resource, indexed by date. Guarded by the
/// resource's lock; holding the guard is holding the resource.
#[derive(Debug)]
pub struct ResourceBook {
    pub resource_id: Ulid,
    days: BTreeMap<NaiveDate, Vec<Ulid>>,
}

impl ResourceBook {
    pub fn new(resource_id: Ulid) -> Self {
        Self {
            resource_id,
            days: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, date: NaiveDate, reservation_id: Ulid) {
        self.days.entry(date).or_default().push(reservation_id);
    }

    pub fn on_date(&self, date: NaiveDate) -> &[Ulid] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keep only the ids on `date` for which `keep` holds.
    pub fn retain(&mut self, date: NaiveDate, keep: impl Fn(&Ulid) -> bool) {
        if let Some(ids) = self.days.get_mut(&date) {
            ids.retain(|id| keep(id));
            if ids.is_empty() {
                self.days.remove(&date);
            }
        }
    }
}

pub type SharedResourceBook = Arc<Mutex<ResourceBook>>;

/// Exclusive handle on a resource. Released on drop.
pub type ResourceHandle = OwnedMutexGuard<ResourceBook>;

/// Exclusive handle on one reservation and the payment, refunds and
/// settlement hanging off it.
pub type RecordHandle = OwnedMutexGuard<()>;

pub struct Store {
    books: DashMap<Ulid, SharedResourceBook>,
    record_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    reservations: DashMap<Ulid, Reservation>,
    payments: DashMap<Ulid, Payment>,
    payment_by_key: DashMap<String, Ulid>,
    /// Payment key → reservation holding it, taken before the payment is logged.
    payment_key_claims: DashMap<String, Ulid>,
    payment_by_reservation: DashMap<Ulid, Ulid>,
    refunds: DashMap<Ulid, Refund>,
    refunds_by_reservation: DashMap<Ulid, Vec<Ulid>>,
    settlements: DashMap<Ulid, Settlement>,
    settlement_by_payment: DashMap<Ulid, Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            books: DashMap::new(),
            record_locks: DashMap::new(),
            reservations: DashMap::new(),
            payments: DashMap::new(),
            payment_by_key: DashMap::new(),
            payment_key_claims: DashMap::new(),
            payment_by_reservation: DashMap::new(),
            refunds: DashMap::new(),
            refunds_by_reservation: DashMap::new(),
            settlements: DashMap::new(),
            settlement_by_payment: DashMap::new(),
        }
    }

    // ── Locking ──────────────────────────────────────────────

    fn book(&self, resource_id: Ulid) -> SharedResourceBook {
        self.books
            .entry(resource_id)
            .or_insert_with(|| Arc::new(Mutex::new(ResourceBook::new(resource_id))))
            .clone()
    }

    /// Wait up to `wait` for the resource's exclusive handle.
    pub async fn lock_resource(&self, resource_id: Ulid, wait: Duration) -> Result<ResourceHandle, EngineError> {
        let book = self.book(resource_id);
        tokio::time::timeout(wait, book.lock_owned())
            .await
            .map_err(|_| EngineError::LockTimeout(resource_id))
    }

    /// Wait up to `wait` for the reservation's exclusive handle.
    pub async fn lock_record(&self, reservation_id: Ulid, wait: Duration) -> Result<RecordHandle, EngineError> {
        let lock = self
            .record_locks
            .entry(reservation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        tokio::time::timeout(wait, lock.lock_owned())
            .await
            .map_err(|_| EngineError::LockTimeout(reservation_id))
    }

    /// Claim `key` for `reservation_id`. Returns the holder's reservation
    /// id when another reservation already has it.
    pub fn claim_payment_key(&self, key: &str, reservation_id: Ulid) -> Result<(), Ulid> {
        let holder = *self
            .payment_key_claims
            .entry(key.to_string())
            .or_insert(reservation_id);
        if holder == reservation_id {
            Ok(())
        } else {
            Err(holder)
        }
    }

    /// Drop a claim whose payment was never logged.
    pub fn release_payment_key(&self, key: &str, reservation_id: Ulid) {
        if self.payment_by_key.contains_key(key) {
            return;
        }
        self.payment_key_claims
            .remove_if(key, |_, holder| *holder == reservation_id);
    }

    /// Forget cancelled reservations on `date`. Cancellation is terminal,
    /// so they can never occupy the book again.
    pub fn prune_cancelled(&self, book: &mut ResourceBook, date: NaiveDate) {
        book.retain(date, |id| {
            self.reservations
                .get(id)
                .is_none_or(|r| r.status != ReservationStatus::Cancelled)
        });
    }

    // ── Queries ──────────────────────────────────────────────

    /// Occupying reservations on the handle's resource for `date`.
    pub fn occupying(&self, book: &ResourceBook, date: NaiveDate) -> Vec<Slot> {
        book.on_date(date)
            .iter()
            .filter_map(|id| self.reservations.get(id))
            .filter(|r| r.status.is_occupying())
            .map(|r| Slot {
                reservation_id: r.id,
                span: r.span(),
            })
            .collect()
    }

    pub fn reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    pub fn reservations_where(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| pred(r.value()))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    pub fn payment(&self, id: &Ulid) -> Option<Payment> {
        self.payments.get(id).map(|p| p.value().clone())
    }

    pub fn payment_by_key(&self, key: &str) -> Option<Payment> {
        let id = *self.payment_by_key.get(key)?.value();
        self.payment(&id)
    }

    pub fn payment_for_reservation(&self, reservation_id: &Ulid) -> Option<Payment> {
        let id = *self.payment_by_reservation.get(reservation_id)?.value();
        self.payment(&id)
    }

    pub fn refund(&self, id: &Ulid) -> Option<Refund> {
        self.refunds.get(id).map(|r| r.value().clone())
    }

    /// Refund attempts for a reservation, oldest first.
    pub fn refunds_for_reservation(&self, reservation_id: &Ulid) -> Vec<Refund> {
        self.refunds_by_reservation
            .get(reservation_id)
            .map(|ids| ids.iter().filter_map(|id| self.refund(id)).collect())
            .unwrap_or_default()
    }

    pub fn refunds_where(&self, pred: impl Fn(&Refund) -> bool) -> Vec<Refund> {
        let mut out: Vec<Refund> = self
            .refunds
            .iter()
            .filter(|r| pred(r.value()))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    pub fn settlement(&self, id: &Ulid) -> Option<Settlement> {
        self.settlements.get(id).map(|s| s.value().clone())
    }

    pub fn settlement_for_payment(&self, payment_id: &Ulid) -> Option<Settlement> {
        let id = *self.settlement_by_payment.get(payment_id)?.value();
        self.settlement(&id)
    }

    pub fn settlements_where(&self, pred: impl Fn(&Settlement) -> bool) -> Vec<Settlement> {
        let mut out: Vec<Settlement> = self
            .settlements
            .iter()
            .filter(|s| pred(s.value()))
            .map(|s| s.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Every record, as the events that recreate it. Used by compaction.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for reservation in self.reservations_where(|_| true) {
            events.push(Event::ReservationBooked { reservation });
        }
        let mut payments: Vec<Payment> = self.payments.iter().map(|p| p.value().clone()).collect();
        payments.sort_by_key(|p| p.id);
        for payment in payments {
            events.push(Event::PaymentRecorded { payment });
        }
        for refund in self.refunds_where(|_| true) {
            events.push(Event::RefundRequested { refund });
        }
        for settlement in self.settlements_where(|_| true) {
            events.push(Event::SettlementCreated { settlement });
        }
        events
    }

    // ── Event application ────────────────────────────────────

    /// Replay path: apply without a caller-held handle.
    pub fn replay_event(&self, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::ReservationBooked { reservation } => {
                let book = self.book(reservation.resource_id);
                let mut guard = book
                    .try_lock()
                    .map_err(|_| EngineError::Internal("replay: resource book contended".into()))?;
                self.apply_event(event, Some(&mut *guard));
            }
            other => self.apply_event(other, None),
        }
        Ok(())
    }

    /// Apply a logged event. `ReservationBooked` needs the resource's book.
    /// Transitions were validated before logging and are applied as-is.
    pub fn apply_event(&self, event: &Event, book: Option<&mut ResourceBook>) {
        match event {
            Event::ReservationBooked { reservation } => {
                if let Some(book) = book {
                    book.insert(reservation.date, reservation.id);
                }
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationConfirmed { id, at } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::Confirmed;
                    r.audit.touch(*at);
                }
            }
            Event::ReservationCompleted { id, at } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::Completed;
                    r.audit.touch(*at);
                }
            }
            Event::ReservationCancelled {
                id,
                reason,
                cancelled_at,
                at,
            } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::Cancelled;
                    r.cancel_reason = Some(reason.clone());
                    r.cancelled_at = Some(*cancelled_at);
                    r.audit.touch(*at);
                }
            }
            Event::PaymentRecorded { payment } => {
                self.payment_by_key.insert(payment.payment_key.clone(), payment.id);
                self.payment_key_claims
                    .insert(payment.payment_key.clone(), payment.reservation_id);
                self.payment_by_reservation.insert(payment.reservation_id, payment.id);
                self.payments.insert(payment.id, payment.clone());
            }
            Event::PaymentStatusChanged { id, status, at } => {
                if let Some(mut p) = self.payments.get_mut(id) {
                    p.status = *status;
                    p.audit.touch(*at);
                }
            }
            Event::RefundRequested { refund } => {
                let mut ids = self.refunds_by_reservation.entry(refund.reservation_id).or_default();
                if !ids.contains(&refund.id) {
                    ids.push(refund.id);
                }
                drop(ids);
                self.refunds.insert(refund.id, refund.clone());
            }
            Event::RefundDispatched { id, at } => {
                if let Some(mut r) = self.refunds.get_mut(id) {
                    r.status = RefundStatus::Processing;
                    r.audit.touch(*at);
                }
            }
            Event::RefundCompleted {
                id,
                transaction_key,
                at,
            } => {
                if let Some(mut r) = self.refunds.get_mut(id) {
                    r.status = RefundStatus::Completed;
                    r.transaction_key = Some(transaction_key.clone());
                    r.refunded_at = Some(*at);
                    r.audit.touch(*at);
                }
            }
            Event::RefundFailed { id, reason, at } => {
                if let Some(mut r) = self.refunds.get_mut(id) {
                    r.status = RefundStatus::Failed;
                    r.failure_reason = Some(reason.clone());
                    r.audit.touch(*at);
                }
            }
            Event::SettlementCreated { settlement } => {
                self.settlement_by_payment.insert(settlement.payment_id, settlement.id);
                self.settlements.insert(settlement.id, settlement.clone());
            }
            Event::SettlementStatusChanged { id, status, at } => {
                if let Some(mut s) = self.settlements.get_mut(id) {
                    s.apply_status(*status, *at);
                }
            }
        }
    }
}
