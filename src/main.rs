use std::sync::Arc;

use tracing::info;

use viewings::clock::SystemClock;
use viewings::config::Config;
use viewings::engine::BookingCoordinator;
use viewings::maintenance::Maintenance;
use viewings::notify::NotifyHub;
use viewings::store::LogStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    viewings::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("viewings.wal");
    let store = Arc::new(LogStore::open(&wal_path)?);
    let hub = Arc::new(NotifyHub::new());

    let coordinator = Arc::new(BookingCoordinator::new(
        store.clone(),
        hub,
        Arc::new(SystemClock),
        config.booking.clone(),
    ));
    let maintenance = Arc::new(Maintenance::new(coordinator, config.maintenance.clone()));
    let jobs = maintenance.spawn();

    info!("viewingsd started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  viewings: {}", store.viewing_count());
    info!("  min lead: {} min", config.booking.min_lead / viewings::model::MINUTE_MS);
    info!("  retry attempts: {}", config.booking.retry.max_attempts);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Run until SIGTERM/ctrl-c
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received, stopping maintenance jobs");
    jobs.abort();

    info!("viewingsd stopped");
    Ok(())
}
