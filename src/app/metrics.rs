//! Prometheus-based metrics module
//!
//! Counters for the data plane: packets read from the device, flows handed
//! to handlers, pool behaviour and UDP session churn. Exposed via /metrics.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Stack Metrics ===

    /// Packets read from the device
    pub static ref PACKETS_RECEIVED: IntCounter = IntCounter::new(
        "cftun_packets_received_total",
        "Total number of packets read from the device"
    ).unwrap();

    /// Malformed packets dropped, by reason
    pub static ref PACKETS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("cftun_packets_dropped_total", "Packets dropped by the demultiplexer"),
        &["reason"]
    ).unwrap();

    // === Dispatcher Metrics ===

    /// Flows handed to a handler, by network
    pub static ref FLOWS_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("cftun_flows_dispatched_total", "Flow events dispatched to handlers"),
        &["network"]
    ).unwrap();

    /// Handler dial failures, by network
    pub static ref FLOWS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("cftun_flows_failed_total", "Flow handlers that failed to reach the edge"),
        &["network"]
    ).unwrap();

    // === Pool Metrics ===

    /// Dials served from a pre-established connection
    pub static ref POOL_HITS: IntCounter = IntCounter::new(
        "cftun_pool_hits_total",
        "Dials served from the connection pool"
    ).unwrap();

    /// Dials that had to connect on demand
    pub static ref POOL_MISSES: IntCounter = IntCounter::new(
        "cftun_pool_misses_total",
        "Dials that connected on demand"
    ).unwrap();

    /// Background refills that failed
    pub static ref POOL_REFILL_FAILURES: IntCounter = IntCounter::new(
        "cftun_pool_refill_failures_total",
        "Background pool refills that failed"
    ).unwrap();

    /// Pooled connections discarded for age
    pub static ref POOL_EXPIRED: IntCounter = IntCounter::new(
        "cftun_pool_expired_total",
        "Pooled connections discarded because they sat idle too long"
    ).unwrap();

    // === UDP Metrics ===

    /// Currently cached UDP sessions
    pub static ref UDP_SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "cftun_udp_sessions_active",
        "Number of cached UDP sessions"
    ).unwrap();

    /// Sessions removed by the idle sweep
    pub static ref UDP_SESSIONS_EVICTED: IntCounter = IntCounter::new(
        "cftun_udp_sessions_evicted_total",
        "UDP sessions evicted by the idle sweep"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(PACKETS_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(PACKETS_DROPPED.clone())).ok();

    REGISTRY.register(Box::new(FLOWS_DISPATCHED.clone())).ok();
    REGISTRY.register(Box::new(FLOWS_FAILED.clone())).ok();

    REGISTRY.register(Box::new(POOL_HITS.clone())).ok();
    REGISTRY.register(Box::new(POOL_MISSES.clone())).ok();
    REGISTRY.register(Box::new(POOL_REFILL_FAILURES.clone())).ok();
    REGISTRY.register(Box::new(POOL_EXPIRED.clone())).ok();

    REGISTRY.register(Box::new(UDP_SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(UDP_SESSIONS_EVICTED.clone())).ok();
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_init_is_repeatable() {
        init_metrics();
        init_metrics();
        PACKETS_DROPPED.with_label_values(&["too_short"]).inc();
        let families = REGISTRY.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "cftun_packets_dropped_total"));
    }
}
