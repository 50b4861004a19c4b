use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, Slot};

impl Engine {
    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.store.reservation(id)
    }

    /// All reservations on a resource for a date, any status, by id.
    pub fn reservations_for(&self, resource_id: Ulid, date: NaiveDate) -> Vec<Reservation> {
        self.store
            .reservations_where(|r| r.resource_id == resource_id && r.date == date)
    }

    pub fn reservations_by_status(&self, status: ReservationStatus) -> Vec<Reservation> {
        self.store.reservations_where(|r| r.status == status)
    }

    /// Occupying slots on a resource for a date, sorted by start.
    pub fn occupying_slots(&self, resource_id: Ulid, date: NaiveDate) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .reservations_for(resource_id, date)
            .into_iter()
            .filter(|r| r.status.is_occupying())
            .map(|r| Slot {
                reservation_id: r.id,
                span: r.span(),
            })
            .collect();
        slots.sort_by_key(|s| s.span.start);
        slots
    }

    /// CANCELLED with a COMPLETED refund. Not stored as its own status.
    pub fn is_refunded(&self, reservation_id: &Ulid) -> bool {
        self.store
            .reservation(reservation_id)
            .is_some_and(|r| r.status == ReservationStatus::Cancelled)
            && self
                .store
                .refunds_for_reservation(reservation_id)
                .iter()
                .any(|r| r.status == RefundStatus::Completed)
    }

    pub fn get_payment(&self, id: &Ulid) -> Option<Payment> {
        self.store.payment(id)
    }

    pub fn payment_for_reservation(&self, reservation_id: &Ulid) -> Option<Payment> {
        self.store.payment_for_reservation(reservation_id)
    }

    pub fn get_refund(&self, id: &Ulid) -> Option<Refund> {
        self.store.refund(id)
    }

    /// Refund attempts, oldest first.
    pub fn refunds_for_reservation(&self, reservation_id: &Ulid) -> Vec<Refund> {
        self.store.refunds_for_reservation(reservation_id)
    }

    pub fn refunds_by_status(&self, status: RefundStatus) -> Vec<Refund> {
        self.store.refunds_where(|r| r.status == status)
    }

    pub fn get_settlement(&self, id: &Ulid) -> Option<Settlement> {
        self.store.settlement(id)
    }

    pub fn settlement_for_payment(&self, payment_id: &Ulid) -> Option<Settlement> {
        self.store.settlement_for_payment(payment_id)
    }

    pub fn settlements_for_owner(&self, owner: SettlementOwner) -> Vec<Settlement> {
        self.store.settlements_where(|s| s.owner == owner)
    }

    pub fn settlements_by_status(&self, status: SettlementStatus) -> Vec<Settlement> {
        self.store.settlements_where(|s| s.status == status)
    }

    pub fn reservation_count(&self) -> usize {
        self.store.reservation_count()
    }
}
