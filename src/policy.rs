//! Cancellation fee tiers and the refund split they produce.
//!
//! Tier thresholds are runtime configuration only. When none are configured
//! the policy degrades to a single zero-refund tier and says so in the logs.

use chrono::{NaiveDateTime, TimeDelta};
use rust_decimal::Decimal;
use tracing::warn;

use crate::engine::EngineError;
use crate::limits::MAX_REFUND_TIERS;
use crate::model::{RefundInfo, ResourceKind, round_money};
use crate::settings::{self, ConfigAccessor};

pub const AFTER_START_LABEL: &str = "after-start:no-refund";
pub const DEFAULT_LABEL: &str = "default:no-refund";

/// Minimum lead time before the reservation starts → fee percentage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundTier {
    pub min_lead: TimeDelta,
    /// Fee as a percentage of the original amount, `0..=100`.
    pub fee_percent: Decimal,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct RefundPolicy {
    /// Sorted by descending `min_lead`.
    tiers: Vec<RefundTier>,
    degraded: bool,
}

impl RefundPolicy {
    pub fn new(mut tiers: Vec<RefundTier>) -> Self {
        tiers.sort_by(|a, b| b.min_lead.cmp(&a.min_lead));
        Self {
            tiers,
            degraded: false,
        }
    }

    /// Built-in fallback used when tiers are missing: nothing is refunded.
    pub fn conservative_default() -> Self {
        Self {
            tiers: vec![RefundTier {
                min_lead: TimeDelta::MIN,
                fee_percent: Decimal::ONE_HUNDRED,
                label: DEFAULT_LABEL.to_string(),
            }],
            degraded: true,
        }
    }

    /// Tiers from `refund.tiers.<kind>`, else `refund.tiers`.
    pub fn from_config(config: &ConfigAccessor, kind: ResourceKind) -> Self {
        let kind_key = match kind {
            ResourceKind::Studio => settings::REFUND_TIERS_STUDIO,
            ResourceKind::Workshop => settings::REFUND_TIERS_WORKSHOP,
        };
        let (key, raw) = match config.get_raw(kind_key) {
            Some(raw) => (kind_key, Some(raw)),
            None => (settings::REFUND_TIERS, config.get_raw(settings::REFUND_TIERS)),
        };

        let problem = match raw.as_deref().map(parse_tiers) {
            Some(Ok(tiers)) if !tiers.is_empty() => return Self::new(tiers),
            Some(Ok(_)) => "no tiers".to_string(),
            Some(Err(e)) => e,
            None => "not set".to_string(),
        };
        metrics::counter!(crate::observability::DEGRADED_CONFIG_TOTAL, "key" => key).increment(1);
        warn!(
            key,
            problem = %problem,
            kind = kind.as_str(),
            "degraded config: refund tiers unavailable, applying no-refund default"
        );
        Self::conservative_default()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn tiers(&self) -> &[RefundTier] {
        &self.tiers
    }

    pub fn compute(
        &self,
        original_amount: Decimal,
        starts_at: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<RefundInfo, EngineError> {
        if original_amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount(original_amount));
        }
        let lead = starts_at.signed_duration_since(now);
        let (fee_percent, label) = match self.tiers.iter().find(|t| lead >= t.min_lead) {
            Some(tier) => (tier.fee_percent, tier.label.as_str()),
            None => (Decimal::ONE_HUNDRED, AFTER_START_LABEL),
        };

        let fee = round_money(original_amount * fee_percent / Decimal::ONE_HUNDRED);
        RefundInfo::new(original_amount, original_amount - fee, label.to_string())
            .ok_or(EngineError::InvariantViolation("refund outside [0, original]"))
    }
}

/// Parse `<lead>:<fee>` entries separated by commas.
///
/// `<lead>` is an integer followed by `d`, `h` or `m`. `<fee>` is a
/// percentage, `full` (no fee) or `none` (no refund).
pub fn parse_tiers(raw: &str) -> Result<Vec<RefundTier>, String> {
    let mut tiers = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if tiers.len() >= MAX_REFUND_TIERS {
            return Err(format!("more than {MAX_REFUND_TIERS} tiers"));
        }
        let (lead, fee) = entry
            .split_once(':')
            .ok_or_else(|| format!("tier `{entry}` is missing `:`"))?;
        let min_lead = parse_lead(lead.trim()).ok_or_else(|| format!("bad lead time in `{entry}`"))?;
        let fee_percent = match fee.trim() {
            "full" => Decimal::ZERO,
            "none" => Decimal::ONE_HUNDRED,
            pct => pct
                .trim_end_matches('%')
                .parse::<Decimal>()
                .map_err(|_| format!("bad fee in `{entry}`"))?,
        };
        if fee_percent < Decimal::ZERO || fee_percent > Decimal::ONE_HUNDRED {
            return Err(format!("fee out of range in `{entry}`"));
        }
        tiers.push(RefundTier {
            min_lead,
            fee_percent,
            label: entry.to_string(),
        });
    }
    Ok(tiers)
}

fn parse_lead(lead: &str) -> Option<TimeDelta> {
    if lead.len() < 2 {
        return None;
    }
    let (n, unit) = lead.split_at(lead.len() - 1);
    let n: i64 = n.parse().ok()?;
    if n < 0 {
        return None;
    }
    match unit {
        "d" => TimeDelta::try_days(n),
        "h" => TimeDelta::try_hours(n),
        "m" => TimeDelta::try_minutes(n),
        _ => None,
    }
}
