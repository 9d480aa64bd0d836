//! Metrics collection and exposition.
//!
//! # Metrics
//! - `protomux_connections_accepted_total` (counter): accepted sockets by service
//! - `protomux_active_remotes` (gauge): physical connections not yet torn down
//! - `protomux_arbitration_total` (counter): exclusivity claims by outcome
//! - `protomux_errors_total` (counter): reported errors by severity
//!
//! # Design Decisions
//! - Recording is always on; without an installed exporter it is a no-op
//! - The Prometheus endpoint only runs when enabled in config

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_accept(service: &str) {
    ::metrics::counter!("protomux_connections_accepted_total", "service" => service.to_string())
        .increment(1);
}

pub fn adjust_active_remotes(delta: f64) {
    ::metrics::gauge!("protomux_active_remotes").increment(delta);
}

pub fn record_arbitration(won: bool) {
    let outcome = if won { "won" } else { "lost" };
    ::metrics::counter!("protomux_arbitration_total", "outcome" => outcome).increment(1);
}

pub fn record_error(severity: &'static str) {
    ::metrics::counter!("protomux_errors_total", "severity" => severity).increment(1);
}
