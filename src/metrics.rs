//! Metrics recorded through the `metrics` facade; the Prometheus exporter
//! is installed at server startup.

use metrics::{counter, histogram};
use std::time::Instant;

pub fn record_request(kind: &'static str, status: u16) {
    counter!("manifold_requests_total", "kind" => kind, "status" => status.to_string())
        .increment(1);
}

pub fn record_duration(kind: &'static str, start: Instant) {
    histogram!("manifold_request_duration_seconds", "kind" => kind)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error() {
    counter!("manifold_upstream_errors_total").increment(1);
}

/// A manifest fetch/rewrite failed and a synthetic manifest was served.
pub fn record_fallback(kind: &'static str) {
    counter!("manifold_manifest_fallbacks_total", "kind" => kind).increment(1);
}
