use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, status (`ok` or failure code).
pub const OPERATIONS_TOTAL: &str = "roster_requests_total";

/// Histogram: engine operation latency in seconds, retries included. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "roster_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: committed bookings. Labels: status (confirmed, waitlisted, scheduled).
pub const BOOKINGS_TOTAL: &str = "roster_bookings_total";

/// Counter: waitlisted reservations promoted to a seat.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "roster_waitlist_promotions_total";

/// Counter: refund payouts that failed and were left pending.
pub const REFUNDS_PENDING_TOTAL: &str = "roster_refunds_pending_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: record-lock waits that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "roster_lock_timeouts_total";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roster_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roster_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roster_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roster_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roster_wal_flush_batch_size";

/// Gauge: transactions appended to the WAL since the process opened it.
pub const WAL_RECORDS_WRITTEN: &str = "roster_wal_records_written";

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
