//! Prometheus metrics for build engine observability.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus) listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    } else {
        tracing::info!(%addr, "Prometheus exporter listening");
    }
}

/// Record a build reaching a terminal status.
pub fn build_status_changed(status: &str) {
    counter!("shipyard_builds_total", "status" => status.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("shipyard_build_duration_ms").record(duration_ms as f64);
}

/// Record a scheduled retry.
pub fn build_retry(reason: &str) {
    counter!("shipyard_build_retries_total", "reason" => reason.to_string()).increment(1);
}

/// Set current number of waiting jobs.
pub fn queue_depth(depth: u64) {
    gauge!("shipyard_queue_depth").set(depth as f64);
}

/// Set current number of attempts executing in this process.
pub fn active_builds(count: usize) {
    gauge!("shipyard_active_builds").set(count as f64);
}

pub fn cache_lookup(lane: &str, result: &str) {
    counter!(
        "shipyard_cache_lookups_total",
        "lane" => lane.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn artifact_size(bytes: u64) {
    histogram!("shipyard_artifact_bytes").record(bytes as f64);
}

pub fn builds_swept(count: usize) {
    counter!("shipyard_swept_builds_total").increment(count as u64);
}
