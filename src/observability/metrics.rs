//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Install the Prometheus recorder and its scrape endpoint
//! - Record per-request host metrics (route, status, outcome, latency)
//!
//! # Metrics
//! - `forwarder_requests_total` (counter): requests by route, status, outcome
//! - `forwarder_request_duration_seconds` (histogram): time to response completion
//! - forwarder stage and transfer metrics, see `telemetry::MetricsTelemetry`
//!
//! # Design Decisions
//! - Low-overhead metric updates through the `metrics` facade
//! - Without an installed recorder every update is a no-op

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::forwarder::ForwarderError;

/// Install the global recorder and serve `/metrics` on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record the end of one proxied request.
pub fn record_request(route: &str, status: u16, outcome: ForwarderError, start: Instant) {
    metrics::counter!(
        "forwarder_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    metrics::histogram!("forwarder_request_duration_seconds", "route" => route.to_string())
        .record(start.elapsed().as_secs_f64());
}
