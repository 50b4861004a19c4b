use std::path::PathBuf;
use std::time::Duration;

/// Process configuration, read from `STUDIO_*` environment variables.
/// Business settings (refund tiers, rates) live in `crate::settings` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub lock_wait: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub settings_file: Option<PathBuf>,
    pub recovery_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            lock_wait: crate::engine::DEFAULT_LOCK_WAIT,
            compact_threshold: 1000,
            metrics_port: None,
            settings_file: None,
            recovery_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.parse::<u64>().ok());
        Self {
            data_dir: lookup("STUDIO_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            lock_wait: parsed("STUDIO_LOCK_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_wait),
            compact_threshold: parsed("STUDIO_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("STUDIO_METRICS_PORT").and_then(|s| s.parse().ok()),
            settings_file: lookup("STUDIO_SETTINGS_FILE").map(PathBuf::from),
            recovery_interval: parsed("STUDIO_RECOVERY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.recovery_interval),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("studiobook.wal")
    }
}
