//! Prometheus metrics for the shaping layer.
//!
//! The [`QosMetrics`] struct owns a dedicated [`Registry`] that an
//! application's `/metrics` endpoint can encode into the Prometheus text
//! exposition format.

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Opts, Registry,
};

/// Counters and gauges covering one shaped listener.
pub struct QosMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    /// Total connections accepted through the wrapper.
    pub connections_accepted: IntCounter,
    /// Connections currently alive.
    pub active_connections: IntGauge,
    /// Total bytes read through shaped connections.
    pub bytes_read: IntCounter,
    /// Total bytes written through shaped connections.
    pub bytes_written: IntCounter,
}

impl QosMetrics {
    /// Create a fresh set of metrics, all registered under a new
    /// [`Registry`].
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_accepted = register_int_counter_with_registry!(
            Opts::new(
                "qos_connections_accepted_total",
                "Total connections accepted through the shaped listener"
            ),
            registry
        )
        .expect("failed to register connections_accepted counter");

        let active_connections = register_int_gauge_with_registry!(
            Opts::new(
                "qos_active_connections",
                "Shaped connections currently alive"
            ),
            registry
        )
        .expect("failed to register active_connections gauge");

        let bytes_read = register_int_counter_with_registry!(
            Opts::new(
                "qos_bytes_read_total",
                "Total bytes read through shaped connections"
            ),
            registry
        )
        .expect("failed to register bytes_read counter");

        let bytes_written = register_int_counter_with_registry!(
            Opts::new(
                "qos_bytes_written_total",
                "Total bytes written through shaped connections"
            ),
            registry
        )
        .expect("failed to register bytes_written counter");

        Self {
            registry,
            connections_accepted,
            active_connections,
            bytes_read,
            bytes_written,
        }
    }
}

impl Default for QosMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_count() {
        let metrics = QosMetrics::new();
        metrics.connections_accepted.inc();
        metrics.active_connections.inc();
        metrics.bytes_written.inc_by(512);

        assert_eq!(metrics.connections_accepted.get(), 1);
        assert_eq!(metrics.active_connections.get(), 1);
        assert_eq!(metrics.bytes_written.get(), 512);
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn registries_are_independent() {
        let a = QosMetrics::new();
        let b = QosMetrics::new();
        a.bytes_read.inc_by(100);
        assert_eq!(b.bytes_read.get(), 0);
    }
}
