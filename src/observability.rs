use std::net::SocketAddr;

// ── Request flow ────────────────────────────────────────────────

/// Counter: accepted booking requests. Labels: status.
pub const REQUESTS_CREATED_TOTAL: &str = "courtside_requests_created_total";

/// Counter: rejected booking candidates. Labels: reason.
pub const REQUESTS_REJECTED_TOTAL: &str = "courtside_requests_rejected_total";

/// Counter: applied lifecycle transitions. Labels: from, to.
pub const TRANSITIONS_TOTAL: &str = "courtside_transitions_total";

/// Counter: refused lifecycle transitions.
pub const INVALID_TRANSITIONS_TOTAL: &str = "courtside_invalid_transitions_total";

// ── Execution ───────────────────────────────────────────────────

/// Counter: executor runs. Labels: outcome (success, failure, error).
pub const EXECUTIONS_TOTAL: &str = "courtside_executions_total";

/// Histogram: executor run time in seconds.
pub const EXECUTION_DURATION_SECONDS: &str = "courtside_execution_duration_seconds";

/// Gauge: executions currently in flight.
pub const EXECUTIONS_IN_FLIGHT: &str = "courtside_executions_in_flight";

// ── Scheduler ───────────────────────────────────────────────────

/// Counter: job outcomes. Labels: job_type, status.
pub const JOBS_TOTAL: &str = "courtside_jobs_total";

/// Gauge: jobs waiting to fire.
pub const JOBS_PENDING: &str = "courtside_jobs_pending";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

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
