use std::sync::Arc;

use tracing::info;

use studiobook::config::EngineConfig;
use studiobook::engine::{Engine, EngineDeps};
use studiobook::pricing::StaticPricing;
use studiobook::reaper;
use studiobook::settings::{ConfigAccessor, JsonFileSettings, MemorySettings, SettingsStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::from_env();
    studiobook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store: Arc<dyn SettingsStore> = match &config.settings_file {
        Some(path) => Arc::new(JsonFileSettings::load(path)?),
        None => Arc::new(MemorySettings::new()),
    };
    let deps = EngineDeps {
        settings: Arc::new(ConfigAccessor::new(store)),
        pricing: Arc::new(StaticPricing::new()),
        gateway: None,
        lock_wait: config.lock_wait,
    };
    let engine = Arc::new(Engine::new(config.wal_path(), deps)?);

    info!("studiobook maintenance daemon started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  reservations: {}", engine.reservation_count());
    info!(
        "  settings: {}",
        config
            .settings_file
            .as_ref()
            .map_or("in-memory".to_string(), |p| p.display().to_string())
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let recovered = engine.recover_missing_refunds().await?;
    if !recovered.is_empty() {
        info!("re-issued {} refunds lost before shutdown", recovered.len());
    }

    let recovery = tokio::spawn(reaper::run_refund_recovery(engine.clone(), config.recovery_interval));
    let compactor = tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping background tasks");
    recovery.abort();
    compactor.abort();

    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("studiobook stopped");
    Ok(())
}
