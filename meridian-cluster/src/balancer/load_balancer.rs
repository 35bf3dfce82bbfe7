//! Load balancing for cluster requests
//!
//! Distributes requests across the healthy nodes handed in by the cluster
//! manager. The balancer tracks per-node weight, in-flight requests and
//! latency; the selection itself is delegated to a [`SelectionStrategy`].

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::strategy::{strategy_for, Candidate, NodeStats, RouteRequest, SelectionStrategy};
use meridian_core::config::LoadBalancingStrategy;

/// Smoothing factor of the response time moving average
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Aggregated request counters across all registered nodes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestTotals {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub active_connections: u64,
    /// Mean of the per-node latency averages
    pub avg_response_ms: f64,
}

/// Load balancer for cluster node selection
pub struct LoadBalancer {
    strategy: Arc<dyn SelectionStrategy>,
    stats: DashMap<String, NodeStats>,
}

impl LoadBalancer {
    /// Create a load balancer with an explicit strategy
    #[must_use]
    pub fn new(strategy: Arc<dyn SelectionStrategy>) -> Self {
        Self {
            strategy,
            stats: DashMap::new(),
        }
    }

    /// Create a load balancer for the configured strategy
    #[must_use]
    pub fn from_config(kind: LoadBalancingStrategy) -> Self {
        Self::new(strategy_for(kind))
    }

    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Start tracking a node; re-registering only updates its weight
    pub fn register_node(&self, node_id: &str, weight: u32) {
        self.stats
            .entry(node_id.to_string())
            .and_modify(|s| s.weight = weight.max(1))
            .or_insert_with(|| NodeStats {
                weight: weight.max(1),
                ..Default::default()
            });
        tracing::debug!(node_id = %node_id, weight = weight, "Node registered with load balancer");
    }

    pub fn deregister_node(&self, node_id: &str) -> bool {
        let removed = self.stats.remove(node_id).is_some();
        if removed {
            tracing::debug!(node_id = %node_id, "Node deregistered from load balancer");
        }
        removed
    }

    #[must_use]
    pub fn is_registered(&self, node_id: &str) -> bool {
        self.stats.contains_key(node_id)
    }

    /// Select a node among `node_ids` for the given request
    #[must_use]
    pub fn select(&self, node_ids: &[String], request: &RouteRequest) -> Option<String> {
        // Sort by node_id for stable ordering across calls
        let mut candidates: Vec<Candidate> = node_ids
            .iter()
            .map(|id| Candidate {
                node_id: id.clone(),
                stats: self.stats.get(id).map(|s| s.clone()).unwrap_or_default(),
            })
            .collect();
        candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let index = self.strategy.select(&candidates, request)?;
        let selected = candidates.get(index)?.node_id.clone();

        tracing::trace!(
            node_id = %selected,
            strategy = self.strategy.name(),
            candidates = candidates.len(),
            "Node selected"
        );
        Some(selected)
    }

    /// Mark a request as dispatched to a node
    pub fn begin_request(&self, node_id: &str) {
        if let Some(mut stats) = self.stats.get_mut(node_id) {
            stats.active_connections += 1;
        }
    }

    /// Record completion of a request started with `begin_request`
    pub fn complete_request(&self, node_id: &str, latency: Duration, success: bool) {
        if let Some(mut stats) = self.stats.get_mut(node_id) {
            stats.active_connections = stats.active_connections.saturating_sub(1);
            stats.total_requests += 1;
            if !success {
                stats.failed_requests += 1;
            }
            let sample = latency.as_secs_f64() * 1000.0;
            stats.avg_response_ms = Some(match stats.avg_response_ms {
                Some(avg) => avg + LATENCY_EWMA_ALPHA * (sample - avg),
                None => sample,
            });
        }
    }

    #[must_use]
    pub fn stats(&self, node_id: &str) -> Option<NodeStats> {
        self.stats.get(node_id).map(|s| s.clone())
    }

    #[must_use]
    pub fn totals(&self) -> RequestTotals {
        let mut totals = RequestTotals::default();
        let mut measured = 0u32;
        let mut latency_sum = 0.0;
        for entry in &self.stats {
            let stats = entry.value();
            totals.total_requests += stats.total_requests;
            totals.failed_requests += stats.failed_requests;
            totals.active_connections += stats.active_connections;
            if let Some(avg) = stats.avg_response_ms {
                measured += 1;
                latency_sum += avg;
            }
        }
        if measured > 0 {
            totals.avg_response_ms = latency_sum / f64::from(measured);
        }
        totals
    }
}
