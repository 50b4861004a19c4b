use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, warn};

// ── Well-known keys ─────────────────────────────────────────────

/// Fallback refund tiers, e.g. `3d:0,1d:50,0d:100`.
pub const REFUND_TIERS: &str = "refund.tiers";
pub const REFUND_TIERS_STUDIO: &str = "refund.tiers.studio";
pub const REFUND_TIERS_WORKSHOP: &str = "refund.tiers.workshop";
pub const DEFAULT_CAPACITY: &str = "resource.default_capacity";
pub const DEFAULT_COMMISSION_RATE: &str = "settlement.commission_rate.default";
pub const TAX_RATE: &str = "settlement.tax_rate";

/// Key/value settings backend, usually edited by administrators.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Runtime-editable settings. Pair every `set`/`remove` with
/// [`ConfigAccessor::evict`] so readers see the change.
#[derive(Default)]
pub struct MemorySettings {
    values: DashMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.values.remove(key).map(|(_, v)| v)
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }
}

/// Settings loaded once from a flat JSON object.
/// Numbers and booleans are kept in their textual form.
pub struct JsonFileSettings {
    values: HashMap<String, String>,
}

impl JsonFileSettings {
    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> io::Result<Self> {
        let parsed: HashMap<String, serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut values = HashMap::with_capacity(parsed.len());
        for (key, value) in parsed {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            values.insert(key, text);
        }
        Ok(Self { values })
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Typed read-through cache over a [`SettingsStore`].
///
/// Misses are cached too, so a key that is absent stays absent until it is
/// evicted. Unparseable values log a warning and yield the caller's default.
pub struct ConfigAccessor {
    store: Arc<dyn SettingsStore>,
    cache: DashMap<String, Option<String>>,
}

impl ConfigAccessor {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Raw value, if the key is set.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        if let Some(hit) = self.cache.get(key) {
            return hit.value().clone();
        }
        metrics::counter!(crate::observability::CONFIG_CACHE_MISSES_TOTAL).increment(1);
        let value = self.store.get(key);
        self.cache.insert(key.to_string(), value.clone());
        value
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_raw(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_parsed(key, default)
    }

    pub fn get_decimal(&self, key: &str, default: Decimal) -> Decimal {
        self.get_parsed(key, default)
    }

    fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        let Some(raw) = self.get_raw(key) else {
            return default;
        };
        match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable setting, using default");
                default
            }
        }
    }

    pub fn evict(&self, key: &str) {
        if self.cache.remove(key).is_some() {
            debug!(key, "evicted setting");
        }
    }

    pub fn evict_all(&self) {
        self.cache.clear();
        debug!("evicted all settings");
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
