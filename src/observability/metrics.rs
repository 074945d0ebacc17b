//! Metrics collection and exposition.
//!
//! # Metrics
//! - `cache_lookups_total` (counter): pre-connect lookups by outcome (hit, miss, error)
//! - `cache_requests_total` (counter): client requests by result
//!   (recorded, replayed, rejected, fault)
//! - `cache_bypass_total` (counter): connections not cached, by reason
//! - `cache_store_errors_total` (counter): store faults swallowed during relay, by op
//! - `proxy_connections_total` (counter): accepted client connections
//! - `proxy_active_connections` (gauge): current connection count

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint. Must run inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter"),
    }
}

pub fn record_cache_lookup(outcome: &'static str) {
    metrics::counter!("cache_lookups_total", "outcome" => outcome).increment(1);
}

pub fn record_cache_request(result: &'static str) {
    metrics::counter!("cache_requests_total", "result" => result).increment(1);
}

pub fn record_cache_bypass(reason: &'static str) {
    metrics::counter!("cache_bypass_total", "reason" => reason).increment(1);
}

pub fn record_store_error(op: &'static str) {
    metrics::counter!("cache_store_errors_total", "op" => op).increment(1);
}

pub fn record_connection_opened(active: u64) {
    metrics::counter!("proxy_connections_total").increment(1);
    metrics::gauge!("proxy_active_connections").set(active as f64);
}

pub fn record_connection_closed(active: u64) {
    metrics::gauge!("proxy_active_connections").set(active as f64);
}
