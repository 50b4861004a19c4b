use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "studiobook_bookings_total";

/// Histogram: time spent waiting for a resource's exclusive handle, seconds.
pub const BOOKING_LOCK_WAIT_SECONDS: &str = "studiobook_booking_lock_wait_seconds";

/// Counter: reservations cancelled.
pub const CANCELLATIONS_TOTAL: &str = "studiobook_cancellations_total";

/// Counter: refunds reaching a terminal state. Labels: status.
pub const REFUNDS_TOTAL: &str = "studiobook_refunds_total";

/// Counter: refunds re-issued by crash recovery.
pub const REFUNDS_RECOVERED_TOTAL: &str = "studiobook_refunds_recovered_total";

/// Counter: settlements created.
pub const SETTLEMENTS_TOTAL: &str = "studiobook_settlements_total";

// ── Warnings ────────────────────────────────────────────────────

/// Counter: settlements whose payout was floored at zero.
pub const NEGATIVE_PAYOUT_TOTAL: &str = "studiobook_negative_payout_total";

/// Counter: built-in defaults applied for missing/bad config. Labels: key.
pub const DEGRADED_CONFIG_TOTAL: &str = "studiobook_degraded_config_total";

/// Counter: settings read through to the backing store.
pub const CONFIG_CACHE_MISSES_TOTAL: &str = "studiobook_config_cache_misses_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "studiobook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (operations per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "studiobook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for an operation result.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::SlotConflict(_)) => "conflict",
        Err(EngineError::LockTimeout(_)) => "lock_timeout",
        Err(EngineError::InvalidInterval { .. }) => "invalid_interval",
        Err(EngineError::CapacityExceeded(_)) => "capacity",
        Err(EngineError::NotFound(..)) => "not_found",
        Err(EngineError::InvalidState { .. }) => "invalid_state",
        Err(EngineError::WalError(_)) => "wal_error",
        Err(_) => "error",
    }
}
