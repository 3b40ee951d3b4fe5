//! Metrics instrumentation for merkle-watch.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! process chooses the exporter.
//!
//! # Metric Naming Convention
//! - `merkle_watch_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed build attempt.
pub fn record_build(success: bool) {
    counter!(
        "merkle_watch_builds_total",
        "status" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record wall-clock build duration (walk + hash + sync).
pub fn record_build_duration(duration: Duration) {
    histogram!("merkle_watch_build_seconds").record(duration.as_secs_f64());
}

/// Record how many files one build hashed.
pub fn record_files_processed(count: usize) {
    histogram!("merkle_watch_build_files").record(count as f64);
}

/// Record a sync outcome: written or short-circuited as unchanged.
pub fn record_sync(written: bool) {
    counter!(
        "merkle_watch_sync_total",
        "outcome" => if written { "written" } else { "unchanged" }
    )
    .increment(1);
}

/// Record a scheduled tick dropped because a build was in flight.
pub fn record_tick_dropped() {
    counter!("merkle_watch_ticks_dropped_total").increment(1);
}

/// Record one cache-tier operation and its outcome.
pub fn record_cache_operation(operation: &'static str, status: &'static str) {
    counter!(
        "merkle_watch_cache_operations_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

/// Set current cache connectivity.
pub fn set_cache_connected(connected: bool) {
    gauge!("merkle_watch_cache_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Set current backend connectivity.
pub fn set_backend_healthy(healthy: bool) {
    gauge!("merkle_watch_backend_healthy").set(if healthy { 1.0 } else { 0.0 });
}

/// Record one operator API request.
pub fn record_http_request(path: &str, status: u16, duration: Duration) {
    counter!(
        "merkle_watch_http_requests_total",
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "merkle_watch_http_request_seconds",
        "path" => path.to_string()
    )
    .record(duration.as_secs_f64());
}
