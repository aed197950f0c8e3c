use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotd_bookings_created_total";

/// Counter: booking requests rejected by the conflict check.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotd_booking_conflicts_total";

/// Counter: lifecycle transitions. Labels: from, to.
pub const TRANSITIONS_TOTAL: &str = "slotd_transitions_total";

/// Histogram: slot generation latency in seconds.
pub const SLOT_GENERATION_DURATION_SECONDS: &str = "slotd_slot_generation_duration_seconds";

// ── Housekeeping ────────────────────────────────────────────────

/// Counter: records affected by a sweep. Labels: sweep.
pub const SWEEP_AFFECTED_TOTAL: &str = "slotd_sweep_affected_total";

/// Counter: per-record sweep failures. Labels: sweep.
pub const SWEEP_FAILURES_TOTAL: &str = "slotd_sweep_failures_total";

/// Histogram: sweep duration in seconds. Labels: sweep.
pub const SWEEP_DURATION_SECONDS: &str = "slotd_sweep_duration_seconds";

// ── Notifications ───────────────────────────────────────────────

/// Counter: notification outcomes. Labels: kind, status.
pub const NOTIFICATIONS_TOTAL: &str = "slotd_notifications_total";

// ── Resource utilization ────────────────────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
