use dashmap::DashMap;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::{Ms, ResourceKind, round_money};

const MS_PER_HOUR: i64 = 3_600_000;

/// Rate card for one bookable studio or workshop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRates {
    pub kind: ResourceKind,
    pub hourly_base_rate: Decimal,
    pub per_person_rate: Decimal,
    /// Platform commission percentage; `None` uses the configured default.
    pub commission_rate: Option<Decimal>,
    /// Max headcount; `None` uses the configured default.
    pub capacity: Option<u32>,
}

impl ResourceRates {
    /// `hourly_base_rate × hours + per_person_rate × headcount`, 2 dp.
    pub fn quote(&self, duration_ms: Ms, headcount: u32) -> Decimal {
        let hours = Decimal::from(duration_ms) / Decimal::from(MS_PER_HOUR);
        round_money(self.hourly_base_rate * hours + self.per_person_rate * Decimal::from(headcount))
    }
}

/// Supplies rate cards; owned by the studio/workshop catalogue.
pub trait PricingSource: Send + Sync {
    fn rates(&self, resource_id: &Ulid) -> Option<ResourceRates>;
}

/// In-memory rate cards.
#[derive(Default)]
pub struct StaticPricing {
    rates: DashMap<Ulid, ResourceRates>,
}

impl StaticPricing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource_id: Ulid, rates: ResourceRates) {
        self.rates.insert(resource_id, rates);
    }

    pub fn remove(&self, resource_id: &Ulid) -> Option<ResourceRates> {
        self.rates.remove(resource_id).map(|(_, r)| r)
    }
}

impl PricingSource for StaticPricing {
    fn rates(&self, resource_id: &Ulid) -> Option<ResourceRates> {
        self.rates.get(resource_id).map(|r| r.value().clone())
    }
}
