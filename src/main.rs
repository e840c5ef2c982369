use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use slotd::config::AppConfig;
use slotd::engine::{Collaborators, Engine};

/// Interval between checks of the WAL compaction threshold.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    slotd::observability::init_tracing(&config.log);
    slotd::observability::init_metrics(config.metrics.port)?;

    let wal_path = config.wal_path();
    let engine = Arc::new(
        Engine::new(
            wal_path.clone(),
            config.engine_settings(),
            Collaborators::default(),
        )
        .with_context(|| format!("opening WAL at {}", wal_path.display()))?,
    );

    tokio::spawn(slotd::reaper::run_reaper(
        engine.clone(),
        Duration::from_secs(config.booking.reaper_interval_secs),
    ));
    tokio::spawn(slotd::reaper::run_compactor(
        engine.clone(),
        config.storage.compact_threshold,
        COMPACT_CHECK_INTERVAL,
    ));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("slotd listening on {addr}");
    info!("  data_dir: {}", config.storage.data_dir.display());
    info!("  providers loaded: {}", engine.provider_count());
    info!(
        "  metrics: {}",
        config
            .metrics
            .port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, slotd::api::router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("slotd stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining requests");
}
