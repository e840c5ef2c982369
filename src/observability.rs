use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (placed, conflict, confirmed, expired, cancelled).
pub const RESERVATIONS_TOTAL: &str = "slotd_reservations_total";

/// Counter: conflicts reported to callers. Labels: type.
pub const CONFLICTS_TOTAL: &str = "slotd_conflicts_total";

/// Counter: bookings committed. Labels: source (reservation, direct, series).
pub const BOOKINGS_TOTAL: &str = "slotd_bookings_total";

/// Counter: lifecycle transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "slotd_booking_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: providers loaded in memory.
pub const PROVIDERS_ACTIVE: &str = "slotd_providers_active";

/// Counter: holds released by the background reaper.
pub const HOLDS_REAPED_TOTAL: &str = "slotd_holds_reaped_total";

/// Counter: reminders the notifier could not accept.
pub const REMINDER_FAILURES_TOTAL: &str = "slotd_reminder_failures_total";

/// Counter: payment collaborator failures.
pub const PAYMENT_FAILURES_TOTAL: &str = "slotd_payment_failures_total";

/// Counter: captured charges left behind by a failed commit that could not be voided.
pub const ORPHANED_CHARGES_TOTAL: &str = "slotd_orphaned_charges_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(cfg: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cfg.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> anyhow::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
