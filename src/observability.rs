use std::net::SocketAddr;

// ── Booking path ────────────────────────────────────────────────

/// Counter: viewings successfully requested.
pub const VIEWINGS_REQUESTED_TOTAL: &str = "viewings_requested_total";

/// Counter: reschedules committed.
pub const VIEWINGS_RESCHEDULED_TOTAL: &str = "viewings_rescheduled_total";

/// Counter: requests rejected because the slot was taken. Labels: stage (precheck, locked).
pub const SLOT_CONFLICTS_TOTAL: &str = "viewings_slot_conflicts_total";

/// Counter: commits retried after an optimistic conflict.
pub const COMMIT_RETRIES_TOTAL: &str = "viewings_commit_retries_total";

/// Counter: operations that gave up after the retry cap.
pub const RETRIES_EXHAUSTED_TOTAL: &str = "viewings_retries_exhausted_total";

/// Counter: lifecycle transitions applied. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "viewings_transitions_total";

// ── Resources ───────────────────────────────────────────────────

/// Gauge: per-property locks currently registered.
pub const PROPERTY_LOCKS_ACTIVE: &str = "viewings_property_locks_active";

/// Histogram: time spent waiting for a property lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "viewings_lock_wait_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "viewings_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "viewings_wal_flush_batch_size";

// ── Maintenance ─────────────────────────────────────────────────

/// Counter: maintenance passes. Labels: job, status (ok, error, panic).
pub const MAINTENANCE_PASSES_TOTAL: &str = "viewings_maintenance_passes_total";

/// Counter: rows handled by maintenance. Labels: job, outcome (applied, skipped).
pub const MAINTENANCE_ITEMS_TOTAL: &str = "viewings_maintenance_items_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(
    port: Option<u16>,
) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
