//! Node selection strategies
//!
//! Each strategy picks one entry out of an already filtered, id-ordered
//! candidate list. Strategies keep only their own cursor state; per-node
//! statistics are owned by the `LoadBalancer` and passed in.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use meridian_core::config::LoadBalancingStrategy;

/// Request attributes a strategy may route on
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub client_ip: Option<String>,
    pub session_id: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
}

impl RouteRequest {
    #[must_use]
    pub fn from_ip(client_ip: impl Into<String>) -> Self {
        Self {
            client_ip: Some(client_ip.into()),
            ..Default::default()
        }
    }
}

/// Per-node routing statistics
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStats {
    pub weight: u32,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Moving average of response time, `None` until the first completion
    pub avg_response_ms: Option<f64>,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            weight: 1,
            active_connections: 0,
            total_requests: 0,
            failed_requests: 0,
            avg_response_ms: None,
        }
    }
}

/// A node eligible for selection
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node_id: String,
    pub stats: NodeStats,
}

/// Load balancing algorithm
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index into `candidates` of the selected node; `None` only if empty
    fn select(&self, candidates: &[Candidate], request: &RouteRequest) -> Option<usize>;
}

/// Build the strategy named in configuration
#[must_use]
pub fn strategy_for(kind: LoadBalancingStrategy) -> Arc<dyn SelectionStrategy> {
    match kind {
        LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobin::default()),
        LoadBalancingStrategy::LeastConnections => Arc::new(LeastConnections),
        LoadBalancingStrategy::Weighted => Arc::new(Weighted::default()),
        LoadBalancingStrategy::IpHash => Arc::new(IpHash::default()),
        LoadBalancingStrategy::LeastResponseTime => Arc::new(LeastResponseTime),
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[Candidate], _request: &RouteRequest) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.cursor.fetch_add(1, Ordering::AcqRel) % candidates.len())
    }
}

/// Fewest in-flight requests; ties go to the first candidate
#[derive(Debug, Default)]
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(&self, candidates: &[Candidate], _request: &RouteRequest) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.stats.active_connections)
            .map(|(i, _)| i)
    }
}

/// Smooth weighted round-robin.
///
/// Every round each candidate gains its weight; the one with the highest
/// running total is picked and pays back the sum of all weights. Over
/// `sum(weights)` selections every node is picked exactly `weight` times,
/// interleaved rather than in bursts.
#[derive(Debug, Default)]
pub struct Weighted {
    current: Mutex<HashMap<String, i64>>,
}

impl SelectionStrategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&self, candidates: &[Candidate], _request: &RouteRequest) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let mut current = self.current.lock();
        current.retain(|id, _| candidates.iter().any(|c| &c.node_id == id));

        let total: i64 = candidates.iter().map(|c| i64::from(c.stats.weight.max(1))).sum();
        let mut best: Option<(usize, i64)> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            let weight = i64::from(candidate.stats.weight.max(1));
            let entry = current.entry(candidate.node_id.clone()).or_insert(0);
            *entry += weight;
            if best.is_none_or(|(_, score)| *entry > score) {
                best = Some((i, *entry));
            }
        }

        let (index, _) = best?;
        if let Some(entry) = current.get_mut(&candidates[index].node_id) {
            *entry -= total;
        }
        Some(index)
    }
}

/// Client affinity by hashing the client address.
///
/// Requests without a client address fall back to round-robin.
#[derive(Debug, Default)]
pub struct IpHash {
    fallback: RoundRobin,
}

impl SelectionStrategy for IpHash {
    fn name(&self) -> &'static str {
        "ip_hash"
    }

    fn select(&self, candidates: &[Candidate], request: &RouteRequest) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let Some(ip) = request.client_ip.as_deref() else {
            return self.fallback.select(candidates, request);
        };

        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        Some((hasher.finish() % candidates.len() as u64) as usize)
    }
}

/// Lowest average response time; unmeasured nodes count as zero
#[derive(Debug, Default)]
pub struct LeastResponseTime;

impl SelectionStrategy for LeastResponseTime {
    fn name(&self) -> &'static str {
        "least_response_time"
    }

    fn select(&self, candidates: &[Candidate], _request: &RouteRequest) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            let latency = candidate.stats.avg_response_ms.unwrap_or(0.0);
            if best.is_none_or(|(_, lowest)| latency < lowest) {
                best = Some((i, latency));
            }
        }
        best.map(|(i, _)| i)
    }
}
