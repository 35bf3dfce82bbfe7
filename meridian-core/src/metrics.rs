//! Prometheus metrics collection
//!
//! All metrics live in one registry so an embedding service can expose them
//! on its own `/metrics` endpoint via [`gather_metrics`].

use prometheus::{Encoder, Registry, TextEncoder};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Cluster membership and health
pub mod cluster {
    use super::REGISTRY;
    use prometheus::{
        register_counter_vec_with_registry, register_histogram_vec_with_registry,
        register_int_counter_with_registry, register_int_gauge_with_registry, CounterVec,
        HistogramVec, IntCounter, IntGauge,
    };

    /// Nodes tracked by the cluster manager
    pub static CLUSTER_NODES: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "meridian_cluster_nodes",
            "Number of nodes tracked by the cluster manager",
            REGISTRY.clone()
        )
        .expect("Failed to register CLUSTER_NODES")
    });

    /// Nodes that are active and healthy
    pub static HEALTHY_NODES: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "meridian_cluster_healthy_nodes",
            "Number of active nodes with healthy status",
            REGISTRY.clone()
        )
        .expect("Failed to register HEALTHY_NODES")
    });

    /// Leadership changes
    pub static LEADER_CHANGES: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "meridian_cluster_leader_changes_total",
            "Total number of leader changes",
            REGISTRY.clone()
        )
        .expect("Failed to register LEADER_CHANGES")
    });

    /// Cluster events by type and severity
    pub static CLUSTER_EVENTS: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
        register_counter_vec_with_registry!(
            "meridian_cluster_events_total",
            "Total number of cluster events",
            &["event_type", "severity"],
            REGISTRY.clone()
        )
        .expect("Failed to register CLUSTER_EVENTS")
    });

    /// Health check execution time
    pub static HEALTH_CHECK_DURATION: std::sync::LazyLock<HistogramVec> =
        std::sync::LazyLock::new(|| {
            register_histogram_vec_with_registry!(
                "meridian_health_check_duration_seconds",
                "Health check execution time in seconds",
                &["check_type", "status"],
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
                REGISTRY.clone()
            )
            .expect("Failed to register HEALTH_CHECK_DURATION")
        });
}

/// Service registry
pub mod discovery {
    use super::REGISTRY;
    use prometheus::{
        register_int_counter_vec_with_registry, register_int_gauge_with_registry, IntCounterVec,
        IntGauge,
    };

    /// Registered service instances across all names
    pub static SERVICE_INSTANCES: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "meridian_service_instances",
            "Number of registered service instances",
            REGISTRY.clone()
        )
        .expect("Failed to register SERVICE_INSTANCES")
    });

    /// Registry changes by kind (registered, deregistered, expired)
    pub static SERVICE_CHANGES: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                "meridian_service_changes_total",
                "Total number of service registry changes",
                &["change"],
                REGISTRY.clone()
            )
            .expect("Failed to register SERVICE_CHANGES")
        });
}

/// Coordination primitives
pub mod coordination {
    use super::REGISTRY;
    use prometheus::{register_int_counter_vec_with_registry, IntCounterVec};

    /// Primitive operations by primitive type, operation and outcome
    pub static PRIMITIVE_OPERATIONS: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                "meridian_primitive_operations_total",
                "Total number of coordination primitive operations",
                &["primitive", "operation", "outcome"],
                REGISTRY.clone()
            )
            .expect("Failed to register PRIMITIVE_OPERATIONS")
        });

    /// Record one primitive operation
    pub fn record(primitive: &str, operation: &str, success: bool) {
        let outcome = if success { "ok" } else { "rejected" };
        PRIMITIVE_OPERATIONS
            .with_label_values(&[primitive, operation, outcome])
            .inc();
    }
}

/// Render all registered metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        cluster::CLUSTER_NODES.set(3);
        cluster::CLUSTER_EVENTS
            .with_label_values(&["node_joined", "info"])
            .inc();
        cluster::HEALTH_CHECK_DURATION
            .with_label_values(&["ttl", "pass"])
            .observe(0.002);
        coordination::record("lock", "acquire", true);

        let output = gather_metrics().unwrap();
        assert!(output.contains("meridian_cluster_nodes"));
        assert!(output.contains("meridian_cluster_events_total"));
        assert!(output.contains("meridian_primitive_operations_total"));
    }
}
