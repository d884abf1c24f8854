//! Prometheus metrics for decisions and cache operations
//!
//! The registry is owned by the application state rather than a global so
//! tests can assert counter deltas on an isolated instance.

use prometheus::{
    histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// Metric families exposed at `/metrics`
pub struct Metrics {
    registry: Registry,

    /// Completed pipeline evaluations
    pub auth_requests_total: IntCounterVec,

    /// Wall time of pipeline evaluations
    pub auth_request_duration_seconds: HistogramVec,

    /// Cache lookups, stores, and invalidations
    pub cache_operations_total: IntCounterVec,

    /// Wall time of cache operations
    pub cache_operation_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Create and register all metric families
    pub fn new() -> Self {
        let registry = Registry::new();

        let auth_requests_total = IntCounterVec::new(
            opts!(
                "auth_requests_total",
                "Total number of authorization decisions"
            ),
            &["endpoint", "outcome", "status_code", "from_cache"],
        )
        .expect("metric can be created");

        let auth_request_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "auth_request_duration_seconds",
                "Authorization decision duration in seconds"
            ),
            &["endpoint", "outcome"],
        )
        .expect("metric can be created");

        let cache_operations_total = IntCounterVec::new(
            opts!(
                "cache_operations_total",
                "Total number of decision-cache operations"
            ),
            &["endpoint", "operation", "result"],
        )
        .expect("metric can be created");

        let cache_operation_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "cache_operation_duration_seconds",
                "Decision-cache operation duration in seconds"
            ),
            &["endpoint", "operation"],
        )
        .expect("metric can be created");

        registry
            .register(Box::new(auth_requests_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(auth_request_duration_seconds.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(cache_operations_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(cache_operation_duration_seconds.clone()))
            .expect("metric can be registered");

        Self {
            registry,
            auth_requests_total,
            auth_request_duration_seconds,
            cache_operations_total,
            cache_operation_duration_seconds,
        }
    }

    /// Encode the registry in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding: {e}")))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {e}")))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_appear_in_exposition() {
        let metrics = Metrics::new();
        metrics
            .auth_requests_total
            .with_label_values(&["default", "pass", "200", "false"])
            .inc();
        metrics
            .cache_operations_total
            .with_label_values(&["default", "lookup", "hit"])
            .inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("auth_requests_total"));
        assert!(text.contains("outcome=\"pass\""));
        assert!(text.contains("cache_operations_total"));
        assert!(text.contains("result=\"hit\""));
    }

    #[test]
    fn test_isolated_registries_do_not_share_counts() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.auth_requests_total
            .with_label_values(&["default", "pass", "200", "false"])
            .inc();
        assert_eq!(
            b.auth_requests_total
                .with_label_values(&["default", "pass", "200", "false"])
                .get(),
            0
        );
    }
}
