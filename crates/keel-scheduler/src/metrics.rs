//! Prometheus counters for dispatch observability.

use metrics::counter;

/// Record a build entering a status.
pub fn build_status_changed(status: &str) {
    counter!("keel_builds_total", "status" => status.to_string()).increment(1);
}

/// Record a build sent to the default route instead of the one it asked for.
pub fn route_fallback(requested: &str, route: &str) {
    counter!(
        "keel_route_fallbacks_total",
        "requested" => requested.to_string(),
        "route" => route.to_string()
    )
    .increment(1);
}

/// Record an allocator retry after losing a number race.
pub fn allocator_retry() {
    counter!("keel_allocator_retries_total").increment(1);
}

/// Record a build that ended in `error` before reaching a worker.
pub fn dispatch_failure(reason: &str) {
    counter!("keel_dispatch_failures_total", "reason" => reason.to_string()).increment(1);
}
