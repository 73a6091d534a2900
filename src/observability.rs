use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "gymdesk_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "gymdesk_request_duration_seconds";

/// Counter: requests rejected by the engine or the access policy. Labels: kind.
pub const REJECTIONS_TOTAL: &str = "gymdesk_rejections_total";

// ── Domain outcomes ─────────────────────────────────────────────

/// Counter: court bookings committed. Labels: op (create, update).
pub const BOOKINGS_COMMITTED_TOTAL: &str = "gymdesk_bookings_committed_total";

/// Counter: class enrollments committed (new or reactivated).
pub const ENROLLMENTS_COMMITTED_TOTAL: &str = "gymdesk_enrollments_committed_total";

/// Counter: classes scheduled.
pub const CLASSES_CREATED_TOTAL: &str = "gymdesk_classes_created_total";

/// Counter: requests denied for lack of plan entitlement. Labels: capability.
pub const ENTITLEMENT_DENIALS_TOTAL: &str = "gymdesk_entitlement_denials_total";

/// Counter: payments recorded. Labels: status.
pub const PAYMENTS_RECORDED_TOTAL: &str = "gymdesk_payments_recorded_total";

/// Counter: routines generated from templates.
pub const ROUTINES_GENERATED_TOTAL: &str = "gymdesk_routines_generated_total";

/// Counter: plan assignments deactivated by the expiry job.
pub const SUBSCRIPTIONS_EXPIRED_TOTAL: &str = "gymdesk_subscriptions_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "gymdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "gymdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "gymdesk_connections_rejected_total";

/// Counter: failed logins.
pub const AUTH_FAILURES_TOTAL: &str = "gymdesk_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gymdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gymdesk_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "gymdesk_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
