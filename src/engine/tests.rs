use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use ulid::Ulid;

use super::refunds::NO_OP_TRANSACTION_KEY;
use super::*;
use crate::gateway::{GatewayError, PaymentGateway, RefundCallback, RefundOutcome, RefundRequest};
use crate::model::*;
use crate::policy::{AFTER_START_LABEL, DEFAULT_LABEL};
use crate::pricing::{ResourceRates, StaticPricing};
use crate::settings::{self, ConfigAccessor, MemorySettings};
use crate::wal::Wal;

const TIERS: &str = "3d:0,1d:50,0d:100";

// ── Fixtures ─────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("studiobook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn at(date: NaiveDate, h: u32) -> NaiveDateTime {
    date.and_time(t(h, 0))
}

fn studio_rates() -> ResourceRates {
    ResourceRates {
        kind: ResourceKind::Studio,
        hourly_base_rate: dec!(100),
        per_person_rate: dec!(0),
        commission_rate: None,
        capacity: Some(10),
    }
}

#[derive(Default)]
struct MockGateway {
    requests: Mutex<Vec<RefundRequest>>,
    reject: bool,
}

impl MockGateway {
    fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<RefundRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn request_refund(&self, request: RefundRequest) -> Result<(), GatewayError> {
        if self.reject {
            return Err(GatewayError::Rejected {
                reason: "card closed".into(),
            });
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

struct Fixture {
    engine: Arc<Engine>,
    settings: Arc<MemorySettings>,
    pricing: Arc<StaticPricing>,
    studio: Ulid,
    path: PathBuf,
}

impl Fixture {
    fn new(name: &str) -> Self {
        Self::build(name, None, DEFAULT_LOCK_WAIT, &[])
    }

    fn with_tiers(name: &str) -> Self {
        Self::build(name, None, DEFAULT_LOCK_WAIT, &[(settings::REFUND_TIERS, TIERS)])
    }

    fn build(
        name: &str,
        gateway: Option<Arc<dyn PaymentGateway>>,
        lock_wait: Duration,
        config: &[(&str, &str)],
    ) -> Self {
        let path = test_wal_path(name);
        let settings = Arc::new(MemorySettings::new());
        for (k, v) in config {
            settings.set(*k, *v);
        }
        let pricing = Arc::new(StaticPricing::new());
        let studio = Ulid::new();
        pricing.insert(studio, studio_rates());
        let engine = open_engine(&path, &settings, &pricing, gateway, lock_wait);
        Self {
            engine,
            settings,
            pricing,
            studio,
            path,
        }
    }

    /// Reopen the WAL in a fresh engine sharing the same collaborators.
    fn reopen(&self) -> Arc<Engine> {
        open_engine(&self.path, &self.settings, &self.pricing, None, DEFAULT_LOCK_WAIT)
    }

    fn request(&self, start: NaiveTime, end: NaiveTime) -> BookingRequest {
        BookingRequest {
            resource_id: self.studio,
            customer_id: Ulid::new(),
            date: day(),
            start_time: start,
            end_time: end,
            headcount: 2,
        }
    }

    async fn book_and_pay(&self, start: NaiveTime, end: NaiveTime) -> (Ulid, PaymentReceipt) {
        let receipt = self.engine.book(self.request(start, end)).await.unwrap();
        let paid = self
            .engine
            .record_payment(
                receipt.reservation_id,
                receipt.total_amount,
                PaymentMethod::Card,
                format!("pk-{}", receipt.reservation_id),
            )
            .await
            .unwrap();
        (receipt.reservation_id, paid)
    }
}

fn open_engine(
    path: &PathBuf,
    settings: &Arc<MemorySettings>,
    pricing: &Arc<StaticPricing>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    lock_wait: Duration,
) -> Arc<Engine> {
    let deps = EngineDeps {
        settings: Arc::new(ConfigAccessor::new(settings.clone())),
        pricing: pricing.clone(),
        gateway,
        lock_wait,
    };
    Arc::new(Engine::new(path.clone(), deps).unwrap())
}

fn gateway_fixture(name: &str, gateway: Arc<MockGateway>) -> Fixture {
    Fixture::build(
        name,
        Some(gateway),
        DEFAULT_LOCK_WAIT,
        &[(settings::REFUND_TIERS, TIERS)],
    )
}

/// Two days before a 10:00 start on `day()`.
fn two_days_before() -> NaiveDateTime {
    at(day() - chrono::Days::new(2), 10)
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn overlap_rejected_adjacent_accepted() {
    let f = Fixture::new("overlap_adjacent.wal");
    let first = f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
    f.engine.confirm(first.reservation_id).await.unwrap();

    let overlapping = f.engine.book(f.request(t(10, 30), t(11, 30))).await;
    assert!(matches!(overlapping, Err(EngineError::SlotConflict(id)) if id == first.reservation_id));

    f.engine.book(f.request(t(11, 0), t(12, 0))).await.unwrap();
    f.engine.book(f.request(t(9, 0), t(10, 0))).await.unwrap();

    let slots = f.engine.occupying_slots(f.studio, day());
    assert_eq!(slots.len(), 3);
    assert!(slots.windows(2).all(|w| w[0].span.end <= w[1].span.start));
}

#[tokio::test]
async fn other_resource_and_date_do_not_conflict() {
    let f = Fixture::new("other_resource.wal");
    let other = Ulid::new();
    f.pricing.insert(other, studio_rates());

    f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
    let mut elsewhere = f.request(t(10, 0), t(11, 0));
    elsewhere.resource_id = other;
    f.engine.book(elsewhere).await.unwrap();
    let mut next_day = f.request(t(10, 0), t(11, 0));
    next_day.date = day().succ_opt().unwrap();
    f.engine.book(next_day).await.unwrap();
}

#[tokio::test]
async fn booking_quotes_duration_and_headcount() {
    let f = Fixture::new("quote.wal");
    f.pricing.insert(
        f.studio,
        ResourceRates {
            per_person_rate: dec!(5),
            ..studio_rates()
        },
    );
    let receipt = f.engine.book(f.request(t(10, 0), t(11, 30))).await.unwrap();
    assert_eq!(receipt.total_amount, dec!(160.00));

    let stored = f.engine.get_reservation(&receipt.reservation_id).unwrap();
    assert_eq!(stored.status, ReservationStatus::Pending);
    assert_eq!(stored.total_amount, dec!(160.00));
    assert_eq!(stored.resource_kind, ResourceKind::Studio);
}

#[tokio::test]
async fn booking_validation() {
    let f = Fixture::new("validation.wal");

    let backwards = f.engine.book(f.request(t(11, 0), t(10, 0))).await;
    assert!(matches!(backwards, Err(EngineError::InvalidInterval { .. })));
    let empty = f.engine.book(f.request(t(10, 0), t(10, 0))).await;
    assert!(matches!(empty, Err(EngineError::InvalidInterval { .. })));

    let mut nobody = f.request(t(10, 0), t(11, 0));
    nobody.headcount = 0;
    assert!(matches!(f.engine.book(nobody).await, Err(EngineError::LimitExceeded(_))));

    let mut crowd = f.request(t(10, 0), t(11, 0));
    crowd.headcount = 11;
    assert!(matches!(f.engine.book(crowd).await, Err(EngineError::CapacityExceeded(10))));

    let mut unknown = f.request(t(10, 0), t(11, 0));
    unknown.resource_id = Ulid::new();
    assert!(matches!(
        f.engine.book(unknown).await,
        Err(EngineError::NotFound("resource", _))
    ));

    assert_eq!(f.engine.reservation_count(), 0);
}

#[tokio::test]
async fn cancelled_reservations_do_not_fill_a_date() {
    let f = Fixture::new("cancelled_day_cap.wal");
    {
        let mut handle = f.engine.store.lock_resource(f.studio, DEFAULT_LOCK_WAIT).await.unwrap();
        let now = Utc::now();
        for _ in 0..crate::limits::MAX_RESERVATIONS_PER_DAY {
            let reservation = Reservation {
                id: Ulid::new(),
                resource_id: f.studio,
                resource_kind: ResourceKind::Studio,
                customer_id: Ulid::new(),
                date: day(),
                start_time: t(10, 0),
                end_time: t(11, 0),
                headcount: 1,
                total_amount: dec!(100),
                status: ReservationStatus::Cancelled,
                cancel_reason: Some(String::new()),
                cancelled_at: Some(at(day(), 8)),
                audit: Audit::at(now),
            };
            f.engine
                .store
                .apply_event(&Event::ReservationBooked { reservation }, Some(&mut *handle));
        }
    }

    let receipt = f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
    let slots = f.engine.occupying_slots(f.studio, day());
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].reservation_id, receipt.reservation_id);
    let handle = f.engine.store.lock_resource(f.studio, DEFAULT_LOCK_WAIT).await.unwrap();
    assert_eq!(handle.on_date(day()), &[receipt.reservation_id]);
}

#[tokio::test]
async fn book_and_cancel_cycles_keep_date_open() {
    let f = Fixture::new("book_cancel_cycles.wal");
    for _ in 0..50 {
        let booked = f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
        f.engine.cancel(booked.reservation_id, String::new(), two_days_before()).await.unwrap();
    }
    let last = f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
    let handle = f.engine.store.lock_resource(f.studio, DEFAULT_LOCK_WAIT).await.unwrap();
    assert_eq!(handle.on_date(day()), &[last.reservation_id]);
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

    #[test]
    fn sequential_bookings_never_overlap(
        intervals in proptest::collection::vec((0u32..1380, 1u32..240), 1..20),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let f = runtime.block_on(async { Fixture::new(&format!("prop_no_overlap_{}.wal", Ulid::new())) });
        let accepted = runtime.block_on(async {
            let mut accepted = 0;
            for (start, len) in intervals {
                let end = (start + len).min(1439);
                let request = f.request(t(start / 60, start % 60), t(end / 60, end % 60));
                match f.engine.book(request).await {
                    Ok(_) => accepted += 1,
                    Err(EngineError::SlotConflict(_)) => {}
                    Err(e) => panic!("unexpected booking error: {e}"),
                }
            }
            accepted
        });

        let slots = f.engine.occupying_slots(f.studio, day());
        proptest::prop_assert_eq!(slots.len(), accepted);
        for (i, a) in slots.iter().enumerate() {
            for b in &slots[i + 1..] {
                proptest::prop_assert!(a.span.end <= b.span.start || b.span.end <= a.span.start);
            }
        }
        let _ = std::fs::remove_file(&f.path);
    }
}

#[tokio::test]
async fn capacity_falls_back_to_config() {
    let f = Fixture::build(
        "capacity_config.wal",
        None,
        DEFAULT_LOCK_WAIT,
        &[(settings::DEFAULT_CAPACITY, "3")],
    );
    f.pricing.insert(
        f.studio,
        ResourceRates {
            capacity: None,
            ..studio_rates()
        },
    );
    let mut req = f.request(t(10, 0), t(11, 0));
    req.headcount = 4;
    assert!(matches!(f.engine.book(req).await, Err(EngineError::CapacityExceeded(3))));
    req.headcount = 3;
    f.engine.book(req).await.unwrap();
}

#[tokio::test]
async fn lock_timeout_while_resource_held() {
    let f = Fixture::build("lock_timeout.wal", None, Duration::from_millis(50), &[]);
    let held = f
        .engine
        .store
        .lock_resource(f.studio, Duration::from_secs(1))
        .await
        .unwrap();

    let result = f.engine.book(f.request(t(10, 0), t(11, 0))).await;
    assert!(matches!(result, Err(EngineError::LockTimeout(id)) if id == f.studio));
    assert!(result.unwrap_err().is_retryable());

    drop(held);
    f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_bookings_one_winner() {
    let f = Fixture::build("concurrent_one_winner.wal", None, Duration::from_secs(10), &[]);
    let mut handles = Vec::new();
    for i in 0..50u32 {
        let engine = f.engine.clone();
        // Every candidate covers 10:00-10:30.
        let req = f.request(t(9, 30 + (i % 30)), t(10, 30 + (i % 29)));
        handles.push(tokio::spawn(async move { engine.book(req).await }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::SlotConflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 49);
    assert_eq!(f.engine.occupying_slots(f.studio, day()).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_never_overlap() {
    let f = Fixture::build("concurrent_no_overlap.wal", None, Duration::from_secs(10), &[]);
    let mut handles = Vec::new();
    for i in 0..80u32 {
        let engine = f.engine.clone();
        let start = (i * 37) % (20 * 60);
        let len = 15 + (i * 13) % 90;
        let end = (start + len).min(23 * 60 + 59);
        let req = f.request(t(start / 60, start % 60), t(end / 60, end % 60));
        handles.push(tokio::spawn(async move { engine.book(req).await }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::SlotConflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let slots = f.engine.occupying_slots(f.studio, day());
    assert_eq!(slots.len(), ok);
    assert!(slots.windows(2).all(|w| !w[0].span.overlaps(&w[1].span)));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn cancelled_unpaid_reservation_frees_slot() {
    let f = Fixture::new("cancel_unpaid.wal");
    let first = f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();

    let outcome = f
        .engine
        .cancel(first.reservation_id, "plans changed".into(), two_days_before())
        .await
        .unwrap();
    assert_eq!(outcome.refund, None);

    let stored = f.engine.get_reservation(&first.reservation_id).unwrap();
    assert_eq!(stored.status, ReservationStatus::Cancelled);
    assert_eq!(stored.cancel_reason.as_deref(), Some("plans changed"));
    assert_eq!(stored.cancelled_at, Some(two_days_before()));

    f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
}

#[tokio::test]
async fn completed_reservation_cannot_be_cancelled() {
    let f = Fixture::with_tiers("cancel_completed.wal");
    let (reservation_id, _) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    f.engine.complete(reservation_id).await.unwrap();

    let err = f
        .engine
        .cancel(reservation_id, "too late".into(), two_days_before())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { from: "COMPLETED", .. }));
    assert!(f.engine.refunds_for_reservation(&reservation_id).is_empty());
    // Completed still occupies its slot.
    assert!(f.engine.book(f.request(t(10, 0), t(11, 0))).await.is_err());
}

#[tokio::test]
async fn illegal_transitions_rejected() {
    let f = Fixture::new("transitions.wal");
    let r = f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
    let id = r.reservation_id;

    assert!(matches!(f.engine.complete(id).await, Err(EngineError::InvalidState { .. })));
    f.engine.confirm(id).await.unwrap();
    assert!(matches!(f.engine.confirm(id).await, Err(EngineError::InvalidState { .. })));
    f.engine.cancel(id, String::new(), two_days_before()).await.unwrap();
    assert!(matches!(
        f.engine.cancel(id, String::new(), two_days_before()).await,
        Err(EngineError::InvalidState { from: "CANCELLED", .. })
    ));
    assert!(matches!(
        f.engine.confirm(Ulid::new()).await,
        Err(EngineError::NotFound("reservation", _))
    ));
}

// ── Payments and settlements ─────────────────────────────

#[tokio::test]
async fn record_payment_confirms_and_settles() {
    let f = Fixture::new("payment_settles.wal");
    f.pricing.insert(
        f.studio,
        ResourceRates {
            hourly_base_rate: dec!(10000),
            ..studio_rates()
        },
    );
    let (reservation_id, receipt) = f.book_and_pay(t(10, 0), t(11, 0)).await;

    assert_eq!(
        f.engine.get_reservation(&reservation_id).unwrap().status,
        ReservationStatus::Confirmed
    );
    assert_eq!(receipt.payment.status, PaymentStatus::Paid);

    let s = &receipt.settlement;
    assert_eq!(s.owner, SettlementOwner::Studio(f.studio));
    assert_eq!(s.total_amount, dec!(10000));
    assert_eq!(s.commission_rate, dec!(10));
    assert_eq!(s.platform_fee, dec!(1000));
    assert_eq!(s.tax_amount, dec!(0));
    assert_eq!(s.payout_amount, dec!(9000));
    assert_eq!(s.status, SettlementStatus::Pending);
    assert_eq!(f.engine.settlement_for_payment(&receipt.payment.id), Some(s.clone()));
    assert_eq!(f.engine.settlements_for_owner(SettlementOwner::Studio(f.studio)).len(), 1);
}

#[tokio::test]
async fn workshop_settlement_uses_rate_card_and_tax() {
    let f = Fixture::build("workshop_settle.wal", None, DEFAULT_LOCK_WAIT, &[(settings::TAX_RATE, "0.1")]);
    let workshop = Ulid::new();
    f.pricing.insert(
        workshop,
        ResourceRates {
            kind: ResourceKind::Workshop,
            hourly_base_rate: dec!(200),
            per_person_rate: dec!(0),
            commission_rate: Some(dec!(15)),
            capacity: None,
        },
    );
    let mut req = f.request(t(10, 0), t(11, 0));
    req.resource_id = workshop;
    let booked = f.engine.book(req).await.unwrap();
    let paid = f
        .engine
        .record_payment(booked.reservation_id, dec!(200), PaymentMethod::EasyPay, "pk-w".into())
        .await
        .unwrap();

    let s = paid.settlement;
    assert_eq!(s.owner, SettlementOwner::Workshop(workshop));
    assert_eq!(s.platform_fee, dec!(30.00));
    assert_eq!(s.tax_amount, dec!(20.00));
    assert_eq!(s.payout_amount, dec!(150.00));
}

#[tokio::test]
async fn record_payment_idempotent_by_key() {
    let f = Fixture::new("payment_idempotent.wal");
    let booked = f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
    let key = "pk-same".to_string();

    let first = f
        .engine
        .record_payment(booked.reservation_id, dec!(100), PaymentMethod::Card, key.clone())
        .await
        .unwrap();
    let again = f
        .engine
        .record_payment(booked.reservation_id, dec!(100), PaymentMethod::Card, key.clone())
        .await
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(f.engine.settlements_by_status(SettlementStatus::Pending).len(), 1);

    let other = f.engine.book(f.request(t(12, 0), t(13, 0))).await.unwrap();
    let stolen = f
        .engine
        .record_payment(other.reservation_id, dec!(100), PaymentMethod::Card, key)
        .await;
    assert!(matches!(stolen, Err(EngineError::AlreadyExists(id)) if id == first.payment.id));

    let second_key = f
        .engine
        .record_payment(booked.reservation_id, dec!(100), PaymentMethod::Card, "pk-other".into())
        .await;
    assert!(matches!(second_key, Err(EngineError::AlreadyExists(_))));

    let zero = f
        .engine
        .record_payment(other.reservation_id, Decimal::ZERO, PaymentMethod::Card, "pk-zero".into())
        .await;
    assert!(matches!(zero, Err(EngineError::InvalidAmount(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_payments_cannot_share_a_key() {
    let f = Fixture::new("payment_key_race.wal");
    for round in 0..20u32 {
        let a = f.engine.book(f.request(t(round, 0), t(round, 30))).await.unwrap();
        let b = f.engine.book(f.request(t(round, 30), t(round + 1, 0))).await.unwrap();
        let key = format!("pk-race-{round}");

        let pay = |id: Ulid, amount: Decimal| {
            let engine = f.engine.clone();
            let key = key.clone();
            tokio::spawn(async move { engine.record_payment(id, amount, PaymentMethod::Card, key).await })
        };
        let first = pay(a.reservation_id, a.total_amount);
        let second = pay(b.reservation_id, b.total_amount);
        let outcomes = [
            (a.reservation_id, first.await.unwrap()),
            (b.reservation_id, second.await.unwrap()),
        ];

        let winners: Vec<_> = outcomes.iter().filter(|(_, r)| r.is_ok()).collect();
        assert_eq!(winners.len(), 1, "round {round}");
        let (winner, receipt) = winners[0];
        assert_eq!(receipt.as_ref().unwrap().payment.reservation_id, *winner);
        let (loser, lost) = outcomes.iter().find(|(_, r)| r.is_err()).unwrap();
        assert!(matches!(lost, Err(EngineError::AlreadyExists(_))));

        let stored = f.engine.store.payment_by_key(&key).unwrap();
        assert_eq!(stored.reservation_id, *winner);

        let amount = f.engine.get_reservation(loser).unwrap().total_amount;
        f.engine
            .record_payment(*loser, amount, PaymentMethod::Card, format!("pk-retry-{round}"))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn failed_payment_releases_key() {
    let f = Fixture::new("payment_key_release.wal");
    let booked = f.engine.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
    f.engine.cancel(booked.reservation_id, String::new(), two_days_before()).await.unwrap();
    let refused = f
        .engine
        .record_payment(booked.reservation_id, dec!(100), PaymentMethod::Card, "pk-reuse".into())
        .await;
    assert!(matches!(refused, Err(EngineError::InvalidState { .. })));

    let other = f.engine.book(f.request(t(12, 0), t(13, 0))).await.unwrap();
    f.engine
        .record_payment(other.reservation_id, other.total_amount, PaymentMethod::Card, "pk-reuse".into())
        .await
        .unwrap();
}

#[tokio::test]
async fn settle_returns_existing_settlement() {
    let f = Fixture::new("settle_existing.wal");
    let (_, receipt) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let settled = f.engine.settle(receipt.payment.id).await.unwrap();
    assert_eq!(settled.id, receipt.settlement.id);
    assert!(matches!(
        f.engine.settle(Ulid::new()).await,
        Err(EngineError::NotFound("payment", _))
    ));
}

#[tokio::test]
async fn settlement_status_transitions() {
    let f = Fixture::new("settlement_transitions.wal");
    let (_, receipt) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let id = receipt.settlement.id;

    let held = f.engine.hold_settlement(id).await.unwrap();
    assert_eq!(held.status, SettlementStatus::Cancelled);
    assert!(matches!(
        f.engine.mark_settlement_paid(id).await,
        Err(EngineError::InvalidState { from: "CANCELLED", .. })
    ));

    f.engine.reopen_settlement(id).await.unwrap();
    let paid = f.engine.mark_settlement_paid(id).await.unwrap();
    assert_eq!(paid.status, SettlementStatus::Paid);
    assert!(paid.settled_at.is_some());
    assert!(matches!(
        f.engine.hold_settlement(id).await,
        Err(EngineError::InvalidState { from: "PAID", .. })
    ));
}

// ── Refunds ──────────────────────────────────────────────

#[tokio::test]
async fn cancel_paid_reservation_two_days_out() {
    let f = Fixture::with_tiers("cancel_two_days.wal");
    let (reservation_id, receipt) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    assert_eq!(receipt.payment.amount, dec!(100.00));

    let outcome = f
        .engine
        .cancel(reservation_id, "sick".into(), two_days_before())
        .await
        .unwrap();
    let (refund_id, info) = outcome.refund.unwrap();
    assert_eq!(info.cancellation_fee, dec!(50.00));
    assert_eq!(info.refund_amount, dec!(50.00));
    assert!(info.is_partial_refund());

    let refund = f.engine.get_refund(&refund_id).unwrap();
    assert_eq!(refund.status, RefundStatus::Pending);
    assert_eq!(refund.payment_id, receipt.payment.id);
    assert_eq!(refund.reason, "sick");
    assert_eq!(refund.original_amount, refund.cancellation_fee + refund.refund_amount);

    assert!(!f.engine.is_refunded(&reservation_id));
    assert_eq!(
        f.engine.get_payment(&receipt.payment.id).unwrap().status,
        PaymentStatus::Paid
    );
}

#[tokio::test]
async fn missing_tiers_apply_no_refund_default() {
    let f = Fixture::new("cancel_no_tiers.wal");
    let (reservation_id, _) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let outcome = f
        .engine
        .cancel(reservation_id, String::new(), two_days_before())
        .await
        .unwrap();
    let (_, info) = outcome.refund.unwrap();
    assert_eq!(info.refund_amount, Decimal::ZERO);
    assert_eq!(info.policy_label, DEFAULT_LABEL);
}

#[tokio::test]
async fn cancel_after_start_refunds_nothing() {
    let f = Fixture::with_tiers("cancel_after_start.wal");
    let (reservation_id, _) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let outcome = f
        .engine
        .cancel(reservation_id, String::new(), at(day(), 10) + chrono::TimeDelta::minutes(5))
        .await
        .unwrap();
    let (_, info) = outcome.refund.unwrap();
    assert_eq!(info.refund_amount, Decimal::ZERO);
    assert_eq!(info.policy_label, AFTER_START_LABEL);
}

#[tokio::test]
async fn tier_change_needs_eviction() {
    let f = Fixture::new("tier_eviction.wal");
    let (first, _) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let (second, _) = f.book_and_pay(t(12, 0), t(13, 0)).await;

    let before = f.engine.cancel(first, String::new(), two_days_before()).await.unwrap();
    assert_eq!(before.refund.unwrap().1.policy_label, DEFAULT_LABEL);

    f.settings.set(settings::REFUND_TIERS, TIERS);
    f.engine.settings().evict(settings::REFUND_TIERS);

    let after = f.engine.cancel(second, String::new(), two_days_before()).await.unwrap();
    assert_eq!(after.refund.unwrap().1.refund_amount, dec!(50.00));
}

#[tokio::test]
async fn refund_completes_through_gateway() {
    let gateway = Arc::new(MockGateway::default());
    let f = gateway_fixture("refund_gateway.wal", gateway.clone());
    let (reservation_id, receipt) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let outcome = f.engine.cancel(reservation_id, "sick".into(), two_days_before()).await.unwrap();
    let (refund_id, _) = outcome.refund.unwrap();

    assert_eq!(f.engine.dispatch_refund(refund_id).await.unwrap(), RefundStatus::Processing);
    let sent = gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].amount, dec!(50.00));
    assert_eq!(sent[0].payment_key, receipt.payment.payment_key);

    let callback = RefundCallback {
        refund_id,
        outcome: RefundOutcome::Succeeded {
            transaction_key: "tx-1".into(),
        },
    };
    let refund = f.engine.handle_refund_callback(callback.clone()).await.unwrap();
    assert_eq!(refund.status, RefundStatus::Completed);
    assert_eq!(refund.transaction_key.as_deref(), Some("tx-1"));
    assert!(refund.refunded_at.is_some());

    assert!(f.engine.is_refunded(&reservation_id));
    assert_eq!(
        f.engine.get_payment(&receipt.payment.id).unwrap().status,
        PaymentStatus::Refunded
    );
    assert_eq!(
        f.engine.get_settlement(&receipt.settlement.id).unwrap().status,
        SettlementStatus::Cancelled
    );

    // Redelivery changes nothing.
    let replayed = f.engine.handle_refund_callback(callback).await;
    assert!(matches!(replayed, Err(EngineError::InvalidState { from: "COMPLETED", .. })));
    assert_eq!(f.engine.get_refund(&refund_id).unwrap(), refund);
}

#[tokio::test]
async fn failed_refund_can_be_retried() {
    let gateway = Arc::new(MockGateway::default());
    let f = gateway_fixture("refund_retry.wal", gateway.clone());
    let (reservation_id, _) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let (refund_id, _) = f
        .engine
        .cancel(reservation_id, String::new(), two_days_before())
        .await
        .unwrap()
        .refund
        .unwrap();

    // Neither retry nor callback is valid before dispatch.
    assert!(f.engine.retry_refund(reservation_id).await.is_err());
    let early = f
        .engine
        .handle_refund_callback(RefundCallback {
            refund_id,
            outcome: RefundOutcome::Failed { reason: "x".into() },
        })
        .await;
    assert!(matches!(early, Err(EngineError::InvalidState { from: "PENDING", .. })));

    f.engine.dispatch_refund(refund_id).await.unwrap();
    let failed = f
        .engine
        .handle_refund_callback(RefundCallback {
            refund_id,
            outcome: RefundOutcome::Failed {
                reason: "issuer declined".into(),
            },
        })
        .await
        .unwrap();
    assert_eq!(failed.status, RefundStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("issuer declined"));
    assert!(!f.engine.is_refunded(&reservation_id));

    let (retry_id, info) = f.engine.retry_refund(reservation_id).await.unwrap();
    assert_ne!(retry_id, refund_id);
    assert_eq!(info.refund_amount, dec!(50.00));
    assert_eq!(f.engine.refunds_for_reservation(&reservation_id).len(), 2);
    assert!(matches!(
        f.engine.retry_refund(reservation_id).await,
        Err(EngineError::InvalidState { from: "PENDING", .. })
    ));
}

#[tokio::test]
async fn gateway_rejection_marks_refund_failed() {
    let gateway = Arc::new(MockGateway::rejecting());
    let f = gateway_fixture("refund_rejected.wal", gateway);
    let (reservation_id, _) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let (refund_id, _) = f
        .engine
        .cancel(reservation_id, String::new(), two_days_before())
        .await
        .unwrap()
        .refund
        .unwrap();

    assert_eq!(f.engine.dispatch_refund(refund_id).await.unwrap(), RefundStatus::Failed);
    let refund = f.engine.get_refund(&refund_id).unwrap();
    assert!(refund.failure_reason.unwrap().contains("card closed"));
}

#[tokio::test]
async fn dispatch_without_gateway_leaves_refund_pending() {
    let f = Fixture::with_tiers("refund_no_gateway.wal");
    let (reservation_id, _) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let (refund_id, _) = f
        .engine
        .cancel(reservation_id, String::new(), two_days_before())
        .await
        .unwrap()
        .refund
        .unwrap();

    assert!(matches!(
        f.engine.dispatch_refund(refund_id).await,
        Err(EngineError::GatewayUnavailable)
    ));
    assert_eq!(f.engine.get_refund(&refund_id).unwrap().status, RefundStatus::Pending);
}

#[tokio::test]
async fn zero_amount_refund_completes_locally() {
    let gateway = Arc::new(MockGateway::default());
    let f = Fixture::build("refund_zero.wal", Some(gateway.clone()), DEFAULT_LOCK_WAIT, &[]);
    let (reservation_id, receipt) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let (refund_id, info) = f
        .engine
        .cancel(reservation_id, String::new(), two_days_before())
        .await
        .unwrap()
        .refund
        .unwrap();
    assert!(info.refund_amount.is_zero());

    assert_eq!(f.engine.dispatch_refund(refund_id).await.unwrap(), RefundStatus::Completed);
    assert!(gateway.sent().is_empty());
    let refund = f.engine.get_refund(&refund_id).unwrap();
    assert_eq!(refund.transaction_key.as_deref(), Some(NO_OP_TRANSACTION_KEY));
    assert_eq!(
        f.engine.get_payment(&receipt.payment.id).unwrap().status,
        PaymentStatus::Cancelled
    );
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let f = Fixture::with_tiers("replay_state.wal");
    let (cancelled, receipt) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let kept = f.engine.book(f.request(t(12, 0), t(13, 0))).await.unwrap();
    let (refund_id, _) = f
        .engine
        .cancel(cancelled, "sick".into(), two_days_before())
        .await
        .unwrap()
        .refund
        .unwrap();
    f.engine.mark_settlement_paid(receipt.settlement.id).await.unwrap();

    let reopened = f.reopen();
    assert_eq!(reopened.reservation_count(), 2);
    assert_eq!(reopened.get_reservation(&cancelled), f.engine.get_reservation(&cancelled));
    assert_eq!(reopened.get_payment(&receipt.payment.id), f.engine.get_payment(&receipt.payment.id));
    assert_eq!(reopened.get_refund(&refund_id), f.engine.get_refund(&refund_id));
    assert_eq!(
        reopened.get_settlement(&receipt.settlement.id).unwrap().status,
        SettlementStatus::Paid
    );

    // Replayed bookings still guard their slots.
    let clash = reopened.book(f.request(t(12, 30), t(13, 30))).await;
    assert!(matches!(clash, Err(EngineError::SlotConflict(id)) if id == kept.reservation_id));
    reopened.book(f.request(t(10, 0), t(11, 0))).await.unwrap();
}

#[tokio::test]
async fn torn_cancel_batch_recovers_refund() {
    let f = Fixture::with_tiers("torn_cancel.wal");
    let (reservation_id, _) = f.book_and_pay(t(10, 0), t(11, 0)).await;

    // Only the first event of the cancel batch made it to disk.
    {
        let mut wal = Wal::open(&f.path).unwrap();
        wal.append(&Event::ReservationCancelled {
            id: reservation_id,
            reason: "sick".into(),
            cancelled_at: two_days_before(),
            at: Utc::now(),
        })
        .unwrap();
    }

    let reopened = f.reopen();
    assert_eq!(
        reopened.get_reservation(&reservation_id).unwrap().status,
        ReservationStatus::Cancelled
    );
    assert!(reopened.refunds_for_reservation(&reservation_id).is_empty());

    let recovered = reopened.recover_missing_refunds().await.unwrap();
    assert_eq!(recovered.len(), 1);
    let refund = reopened.get_refund(&recovered[0]).unwrap();
    assert_eq!(refund.refund_amount, dec!(50.00));
    assert_eq!(refund.reason, "sick");

    assert!(reopened.recover_missing_refunds().await.unwrap().is_empty());
}

#[tokio::test]
async fn compaction_preserves_state() {
    let f = Fixture::with_tiers("compaction.wal");
    let (cancelled, _) = f.book_and_pay(t(10, 0), t(11, 0)).await;
    let kept = f.engine.book(f.request(t(12, 0), t(13, 0))).await.unwrap();
    f.engine.confirm(kept.reservation_id).await.unwrap();
    f.engine.cancel(cancelled, String::new(), two_days_before()).await.unwrap();
    assert!(f.engine.wal_appends_since_compact().await > 0);

    f.engine.compact_wal().await.unwrap();
    assert_eq!(f.engine.wal_appends_since_compact().await, 0);

    // Appends after compaction land in the new file.
    let later = f.engine.book(f.request(t(14, 0), t(15, 0))).await.unwrap();

    let reopened = f.reopen();
    assert_eq!(reopened.reservation_count(), 3);
    for id in [cancelled, kept.reservation_id, later.reservation_id] {
        assert_eq!(reopened.get_reservation(&id), f.engine.get_reservation(&id));
    }
    assert_eq!(reopened.refunds_for_reservation(&cancelled).len(), 1);
    assert_eq!(reopened.occupying_slots(f.studio, day()).len(), 2);
}
