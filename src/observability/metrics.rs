//! Metrics collection.
//!
//! # Metrics
//! - `kvrouter_requests_total` (counter): requests entering the tree
//! - `kvrouter_generation_installs_total` (counter): tree swaps
//! - `kvrouter_throttled_total` (counter): admission rejections by limit
//! - `kvrouter_suppressed_errors_total` (counter): failures of discarded
//!   fire-and-forget dispatches, by policy
//! - `kvrouter_lookaside_total` (counter): lookaside lookups by outcome
//! - `kvrouter_devnull_requests_total` (counter): requests swallowed by
//!   the devnull leaf

use std::time::Instant;

use metrics::{counter, histogram};

/// Record a request entering the routing tree and its latency.
pub fn record_request(op: &'static str, outcome: &'static str, start: Instant) {
    counter!("kvrouter_requests_total", "op" => op, "outcome" => outcome).increment(1);
    histogram!("kvrouter_request_duration_seconds", "op" => op)
        .record(start.elapsed().as_secs_f64());
}

/// Record an atomic route-tree swap.
pub fn record_generation_install(generation: u64, nodes: usize) {
    counter!("kvrouter_generation_installs_total").increment(1);
    tracing::info!(generation, nodes, "Route tree installed");
}

/// Record an admission-policy rejection.
pub fn record_throttled(limit: &'static str) {
    counter!("kvrouter_throttled_total", "limit" => limit).increment(1);
}

/// Record a failure from a dispatch whose result is discarded by design.
pub fn record_suppressed_error(policy: &'static str) {
    counter!("kvrouter_suppressed_errors_total", "policy" => policy).increment(1);
}

/// Record a lookaside lookup outcome.
pub fn record_lookaside(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("kvrouter_lookaside_total", "outcome" => outcome).increment(1);
}

/// Record a request swallowed by the devnull leaf.
pub fn record_devnull() {
    counter!("kvrouter_devnull_requests_total").increment(1);
}
