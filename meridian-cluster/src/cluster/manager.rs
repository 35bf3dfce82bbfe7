//! Cluster membership, leadership and failover
//!
//! All membership and leader state lives in one `ClusterState` behind a
//! mutex. Health probes run outside the lock; their verdicts are applied
//! in a single critical section together with the events they cause.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::autoscaler::{AutoScaler, ScalingDecision};
use super::election;
use super::events::{ClusterEvent, ClusterEventType, EventLog, Severity};
use super::node::{ClusterNode, NodeResources, NodeSpec, NodeStatus};
use crate::balancer::{LoadBalancer, RouteRequest, SelectionStrategy};
use crate::error::{Error, Result};
use crate::health::{self, cycle_interval, HealthStatus, ProbeRegistry};
use crate::timers::TimerSet;
use meridian_core::config::{ClusterConfiguration, NodeRole};
use meridian_core::metrics::cluster::{CLUSTER_NODES, HEALTHY_NODES, LEADER_CHANGES};

const CONSENSUS_TIMER: &str = "consensus";
const AUTOSCALE_TIMER: &str = "autoscale";

fn health_timer(node_id: &str) -> String {
    format!("health:{node_id}")
}

/// Request statistics supplied by an external collector
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetrics {
    /// Requests per second
    pub request_rate: f64,
    pub average_latency_ms: f64,
    /// Percent of failed requests
    pub error_rate: f64,
}

/// Point-in-time cluster metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub node_count: usize,
    pub healthy_nodes: usize,
    pub active_nodes: usize,
    /// Average cpu usage of active nodes, percent
    pub cpu_utilization: f64,
    /// Average memory usage of active nodes, percent
    pub memory_utilization: f64,
    /// Inbound plus outbound traffic of active nodes, Mbit/s
    pub network_throughput: f64,
    pub uptime: Duration,
    /// Percent of nodes that are healthy
    pub availability: f64,
    pub request_rate: f64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub healthy: bool,
    pub node_count: usize,
    pub healthy_nodes: usize,
    pub leader: Option<String>,
    pub term: u64,
    pub consensus: bool,
    pub desired_size: Option<usize>,
    pub metrics: ClusterMetrics,
}

struct ClusterState {
    /// Registration order doubles as the election tie-break
    nodes: IndexMap<String, ClusterNode>,
    leader: Option<String>,
    term: u64,
    /// Set while no node is eligible for leadership
    consensus_lost: bool,
    quorum_met: bool,
    local_node_id: Option<String>,
    desired_size: Option<usize>,
    request_metrics: Option<RequestMetrics>,
    events: EventLog,
}

impl ClusterState {
    fn emit(&mut self, event: ClusterEvent) {
        self.events.append(event);
    }

    fn healthy_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_available()).count()
    }

    fn leader_available(&self) -> bool {
        self.leader
            .as_ref()
            .and_then(|id| self.nodes.get(id))
            .is_some_and(ClusterNode::is_available)
    }

    /// Run a full election; returns the leader afterwards
    fn elect(&mut self) -> Option<String> {
        let winner = election::elect(self.nodes.values()).map(|n| (n.id.clone(), n.priority()));

        let Some((leader, priority)) = winner else {
            self.leader = None;
            if !self.consensus_lost {
                self.consensus_lost = true;
                error!("No healthy node eligible for leadership, consensus lost");
                self.emit(ClusterEvent::new(
                    ClusterEventType::ConsensusLost,
                    Severity::Critical,
                    "no healthy node eligible for leadership",
                ));
            }
            return None;
        };

        if self.leader.as_deref() != Some(leader.as_str()) {
            self.install_leader(&leader, "election");
            debug!(node_id = %leader, priority = priority, "Election priority");
        }
        self.restore_consensus();
        Some(leader)
    }

    fn install_leader(&mut self, leader: &str, reason: &str) {
        let previous = self.leader.replace(leader.to_string());
        self.term += 1;
        LEADER_CHANGES.inc();
        info!(
            node_id = %leader,
            term = self.term,
            previous = previous.as_deref().unwrap_or("none"),
            reason = reason,
            "Leader elected"
        );
        let term = self.term;
        self.emit(
            ClusterEvent::new(
                ClusterEventType::LeaderElected,
                Severity::Info,
                format!("node {leader} is leader for term {term}"),
            )
            .with_node(leader)
            .with_meta("term", term)
            .with_meta("previous_leader", previous)
            .with_meta("reason", reason),
        );
    }

    fn restore_consensus(&mut self) {
        if self.consensus_lost {
            self.consensus_lost = false;
            info!("Consensus restored");
            self.emit(ClusterEvent::new(
                ClusterEventType::ConsensusRestored,
                Severity::Info,
                "a healthy leader is available again",
            ));
        }
    }

    /// Promote `target`, or the best healthy non-leader, to primary leader
    fn failover(&mut self, target: Option<&str>) -> bool {
        let previous = self.leader.clone();
        warn!(
            previous = previous.as_deref().unwrap_or("none"),
            target = target.unwrap_or("auto"),
            "Failover started"
        );
        self.emit(
            ClusterEvent::new(ClusterEventType::FailoverStarted, Severity::Warning, "failover started")
                .with_meta("previous_leader", previous.clone())
                .with_meta("target", target.map(str::to_string)),
        );

        let chosen = match target {
            Some(id) => self
                .nodes
                .get(id)
                .filter(|n| n.is_available())
                .map(|n| n.id.clone()),
            None => election::failover_candidate(self.nodes.values(), previous.as_deref())
                .map(|n| n.id.clone()),
        };

        let Some(promoted) = chosen else {
            warn!("Failover found no eligible target");
            self.emit(
                ClusterEvent::new(
                    ClusterEventType::FailoverCompleted,
                    Severity::Error,
                    "failover failed: no eligible target",
                )
                .with_meta("success", false),
            );
            return false;
        };

        if let Some(prev) = previous.as_deref().filter(|p| *p != promoted) {
            if let Some(node) = self.nodes.get_mut(prev) {
                if node.role == NodeRole::Primary {
                    node.role = NodeRole::Secondary;
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(&promoted) {
            node.role = NodeRole::Primary;
        }
        if previous.as_deref() != Some(promoted.as_str()) {
            self.install_leader(&promoted, "failover");
        }
        self.restore_consensus();

        self.emit(
            ClusterEvent::new(
                ClusterEventType::FailoverCompleted,
                Severity::Info,
                format!("node {promoted} promoted to leader"),
            )
            .with_node(&promoted)
            .with_meta("success", true)
            .with_meta("previous_leader", previous),
        );
        true
    }

    /// Remove a node unless that would leave too few healthy nodes
    fn remove(&mut self, node_id: &str, min_nodes: usize) -> Result<Option<ClusterNode>> {
        let Some(node) = self.nodes.get(node_id) else {
            return Ok(None);
        };
        let healthy = self.healthy_count();
        if node.is_available() && healthy <= min_nodes {
            return Err(Error::Precondition(format!(
                "cannot remove healthy node {node_id}: {healthy} healthy nodes, minimum is {min_nodes}"
            )));
        }

        let Some(node) = self.nodes.shift_remove(node_id) else {
            return Ok(None);
        };
        self.emit(
            ClusterEvent::new(
                ClusterEventType::NodeLeft,
                Severity::Info,
                format!("node {node_id} left the cluster"),
            )
            .with_node(node_id),
        );
        if self.leader.as_deref() == Some(node_id) {
            self.leader = None;
            self.elect();
        }
        Ok(Some(node))
    }

    fn metrics(&self, balancer: &LoadBalancer, uptime: Duration) -> ClusterMetrics {
        let node_count = self.nodes.len();
        let healthy_nodes = self.healthy_count();
        let active: Vec<&ClusterNode> = self
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .collect();

        let average = |f: fn(&ClusterNode) -> f64| {
            if active.is_empty() {
                0.0
            } else {
                active.iter().map(|n| f(n)).sum::<f64>() / active.len() as f64
            }
        };
        let cpu_utilization = average(|n| n.resources.cpu.usage);
        let memory_utilization = average(|n| n.resources.memory.usage);
        let network_throughput = active
            .iter()
            .map(|n| n.resources.network.inbound + n.resources.network.outbound)
            .sum();
        let availability = if node_count == 0 {
            0.0
        } else {
            100.0 * healthy_nodes as f64 / node_count as f64
        };

        let requests = self.request_metrics.unwrap_or_else(|| {
            let totals = balancer.totals();
            let secs = uptime.as_secs_f64();
            RequestMetrics {
                request_rate: if secs > 0.0 { totals.total_requests as f64 / secs } else { 0.0 },
                average_latency_ms: totals.avg_response_ms,
                error_rate: if totals.total_requests == 0 {
                    0.0
                } else {
                    100.0 * totals.failed_requests as f64 / totals.total_requests as f64
                },
            }
        });

        ClusterMetrics {
            node_count,
            healthy_nodes,
            active_nodes: active.len(),
            cpu_utilization,
            memory_utilization,
            network_throughput,
            uptime,
            availability,
            request_rate: requests.request_rate,
            average_latency_ms: requests.average_latency_ms,
            error_rate: requests.error_rate,
        }
    }
}

struct Shared {
    config: Arc<ClusterConfiguration>,
    probes: ProbeRegistry,
    balancer: LoadBalancer,
    autoscaler: Mutex<AutoScaler>,
    state: Mutex<ClusterState>,
    timers: TimerSet,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    created_at: DateTime<Utc>,
}

/// Cluster manager
///
/// Owns node membership, drives per-node health checks, elects the leader,
/// performs failover and scaling, and routes requests to healthy nodes.
/// Cloning is cheap; clones share the same cluster.
#[derive(Clone)]
pub struct ClusterManager {
    shared: Arc<Shared>,
}

impl ClusterManager {
    /// Create a cluster manager using the configured balancing strategy
    pub fn new(config: ClusterConfiguration, probes: ProbeRegistry) -> Result<Self> {
        let balancer = LoadBalancer::from_config(config.load_balancing.strategy);
        Self::build(config, probes, balancer)
    }

    /// Create a cluster manager with a custom selection strategy
    pub fn with_strategy(
        config: ClusterConfiguration,
        probes: ProbeRegistry,
        strategy: Arc<dyn SelectionStrategy>,
    ) -> Result<Self> {
        Self::build(config, probes, LoadBalancer::new(strategy))
    }

    fn build(config: ClusterConfiguration, probes: ProbeRegistry, balancer: LoadBalancer) -> Result<Self> {
        config.validate()?;

        let state = ClusterState {
            nodes: IndexMap::new(),
            leader: None,
            term: 0,
            consensus_lost: false,
            quorum_met: true,
            local_node_id: None,
            desired_size: None,
            request_metrics: None,
            events: EventLog::new(config.monitoring.event_log_capacity),
        };

        info!(
            cluster = %config.name,
            min_nodes = config.min_nodes,
            max_nodes = config.max_nodes,
            strategy = balancer.strategy_name(),
            "Cluster manager created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                autoscaler: Mutex::new(AutoScaler::new(config.auto_scaling.clone())),
                config: Arc::new(config),
                probes,
                balancer,
                state: Mutex::new(state),
                timers: TimerSet::new(),
                running: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                created_at: Utc::now(),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClusterConfiguration {
        &self.shared.config
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn local_node_id(&self) -> Option<String> {
        self.shared.state.lock().local_node_id.clone()
    }

    /// Join the cluster and start background timers
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        self.shared.timers.reset();

        let local_present = {
            let state = self.shared.state.lock();
            state
                .local_node_id
                .as_ref()
                .is_some_and(|id| state.nodes.contains_key(id))
        };
        if !local_present {
            let node = self.add_node(self.local_node_spec())?;
            self.shared.state.lock().local_node_id = Some(node.id);
        }

        self.shared.running.store(true, Ordering::Release);

        let default_interval = self.shared.config.monitoring.health_check_interval();
        let timers: Vec<(String, Duration)> = {
            let mut state = self.shared.state.lock();
            if !state.leader_available() {
                state.elect();
            }
            state
                .nodes
                .values()
                .map(|n| (n.id.clone(), cycle_interval(&n.health.checks, default_interval)))
                .collect()
        };
        for (node_id, period) in timers {
            self.spawn_health_timer(&node_id, period);
        }
        self.spawn_consensus_timer();
        if self.shared.config.auto_scaling.enabled {
            self.spawn_autoscale_timer();
        }

        info!(
            cluster = %self.shared.config.name,
            node_id = self.local_node_id().as_deref().unwrap_or_default(),
            "Cluster manager started"
        );
        Ok(())
    }

    /// Stop every timer and leave the cluster.
    ///
    /// Waits for running health cycles up to the configured grace period,
    /// then aborts them. No timer callback runs after this returns.
    pub async fn stop(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.shared
            .timers
            .shutdown(self.shared.config.monitoring.stop_grace_period())
            .await;

        {
            let mut state = self.shared.state.lock();
            if let Some(local) = state.local_node_id.take() {
                if state.nodes.shift_remove(&local).is_some() {
                    self.shared.balancer.deregister_node(&local);
                    state.emit(
                        ClusterEvent::new(
                            ClusterEventType::NodeLeft,
                            Severity::Info,
                            format!("local node {local} left the cluster"),
                        )
                        .with_node(&local),
                    );
                    if state.leader.as_deref() == Some(local.as_str()) {
                        state.leader = None;
                        state.elect();
                    }
                }
            }
            self.publish_gauges(&state);
        }

        info!(cluster = %self.shared.config.name, "Cluster manager stopped");
    }

    fn local_node_spec(&self) -> NodeSpec {
        let local = &self.shared.config.local_node;
        let mut spec = NodeSpec::new(local.address.clone(), local.port).with_role(local.role);
        spec.region = Some(local.region.clone()).filter(|r| !r.is_empty());
        spec.zone = Some(local.zone.clone()).filter(|z| !z.is_empty());
        spec.capabilities = local.capabilities.iter().cloned().collect();
        spec
    }

    /// Add a node; unset fields of `spec` get defaults
    pub fn add_node(&self, spec: NodeSpec) -> Result<ClusterNode> {
        let config = &self.shared.config;
        let node = spec.build(Utc::now());
        let period = cycle_interval(&node.health.checks, config.monitoring.health_check_interval());

        {
            let mut state = self.shared.state.lock();
            if state.nodes.len() >= config.max_nodes {
                warn!(max_nodes = config.max_nodes, "Rejected node join, cluster is full");
                return Err(Error::Precondition(format!(
                    "cluster already has the maximum of {} nodes",
                    config.max_nodes
                )));
            }
            if state.nodes.contains_key(&node.id) {
                return Err(Error::AlreadyExists(format!("node {}", node.id)));
            }

            state.nodes.insert(node.id.clone(), node.clone());
            self.shared.balancer.register_node(&node.id, node.weight());
            state.emit(
                ClusterEvent::new(
                    ClusterEventType::NodeJoined,
                    Severity::Info,
                    format!("node {} joined the cluster", node.id),
                )
                .with_node(&node.id)
                .with_meta("role", node.role.as_str())
                .with_meta("address", format!("{}:{}", node.address, node.port)),
            );
            if state.leader.is_none() {
                state.elect();
            }
            self.publish_gauges(&state);
        }

        if self.is_running() {
            self.spawn_health_timer(&node.id, period);
        }
        info!(node_id = %node.id, role = node.role.as_str(), "Node joined cluster");
        Ok(node)
    }

    /// Remove a node; `Ok(false)` if it is unknown.
    ///
    /// Refused while the node is healthy and the healthy count is already
    /// at or below `min_nodes`.
    pub fn remove_node(&self, node_id: &str) -> Result<bool> {
        let removed = {
            let mut state = self.shared.state.lock();
            let removed = state.remove(node_id, self.shared.config.min_nodes);
            if let Ok(Some(_)) = &removed {
                self.shared.balancer.deregister_node(node_id);
                self.publish_gauges(&state);
            }
            removed
        };

        match removed {
            Ok(Some(_)) => {
                self.shared.timers.cancel(&health_timer(node_id));
                info!(node_id = %node_id, "Node removed from cluster");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Node removal refused");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn get_node(&self, node_id: &str) -> Option<ClusterNode> {
        self.shared.state.lock().nodes.get(node_id).cloned()
    }

    /// All nodes in registration order
    #[must_use]
    pub fn list_nodes(&self) -> Vec<ClusterNode> {
        self.shared.state.lock().nodes.values().cloned().collect()
    }

    #[must_use]
    pub fn leader(&self) -> Option<String> {
        self.shared.state.lock().leader.clone()
    }

    #[must_use]
    pub fn term(&self) -> u64 {
        self.shared.state.lock().term
    }

    /// Record a heartbeat from a node
    pub fn heartbeat(&self, node_id: &str) -> bool {
        let mut state = self.shared.state.lock();
        let Some(node) = state.nodes.get_mut(node_id) else {
            return false;
        };
        node.last_heartbeat = Utc::now();
        true
    }

    pub fn update_node_resources(&self, node_id: &str, resources: NodeResources) -> bool {
        let mut state = self.shared.state.lock();
        let Some(node) = state.nodes.get_mut(node_id) else {
            return false;
        };
        node.resources = resources;
        true
    }

    /// Put a node into or take it out of maintenance.
    ///
    /// Maintenance nodes leave routing and leadership; leaving maintenance
    /// returns the node to active (or unhealthy if its checks say so).
    pub fn set_maintenance(&self, node_id: &str, enabled: bool) -> bool {
        let mut state = self.shared.state.lock();
        let Some(node) = state.nodes.get_mut(node_id) else {
            return false;
        };

        let in_maintenance = node.status == NodeStatus::Maintenance;
        if enabled == in_maintenance {
            return true;
        }
        node.status = if enabled {
            NodeStatus::Maintenance
        } else if node.health.status == HealthStatus::Unhealthy {
            NodeStatus::Unhealthy
        } else {
            NodeStatus::Active
        };

        let (severity, message) = if enabled {
            (Severity::Warning, format!("node {node_id} entered maintenance"))
        } else {
            (Severity::Info, format!("node {node_id} left maintenance"))
        };
        state.emit(
            ClusterEvent::new(ClusterEventType::NodeMaintenance, severity, message)
                .with_node(node_id)
                .with_meta("maintenance", enabled),
        );
        info!(node_id = %node_id, maintenance = enabled, "Node maintenance changed");

        if !state.leader_available() {
            state.elect();
        }
        self.publish_gauges(&state);
        true
    }

    #[must_use]
    pub fn get_cluster_status(&self) -> ClusterStatus {
        let state = self.shared.state.lock();
        let healthy_nodes = state.healthy_count();
        let consensus = healthy_nodes >= self.shared.config.consensus.quorum_size;
        ClusterStatus {
            healthy: healthy_nodes >= self.shared.config.min_nodes && consensus,
            node_count: state.nodes.len(),
            healthy_nodes,
            leader: state.leader.clone(),
            term: state.term,
            consensus,
            desired_size: state.desired_size,
            metrics: state.metrics(&self.shared.balancer, self.uptime()),
        }
    }

    #[must_use]
    pub fn get_cluster_metrics(&self) -> ClusterMetrics {
        self.shared
            .state
            .lock()
            .metrics(&self.shared.balancer, self.uptime())
    }

    /// Override the request statistics with values from an external collector
    pub fn record_request_metrics(&self, metrics: RequestMetrics) {
        self.shared.state.lock().request_metrics = Some(metrics);
    }

    fn uptime(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.shared.created_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Pick a healthy node for a request; `None` if no node is healthy
    #[must_use]
    pub fn route_request(&self, request: &RouteRequest) -> Option<ClusterNode> {
        let state = self.shared.state.lock();
        let candidates: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.is_available())
            .map(|n| n.id.clone())
            .collect();
        let selected = self.shared.balancer.select(&candidates, request)?;
        state.nodes.get(&selected).cloned()
    }

    /// Track a request dispatched to `node_id`
    pub fn begin_request(&self, node_id: &str) {
        self.shared.balancer.begin_request(node_id);
    }

    pub fn complete_request(&self, node_id: &str, latency: Duration, success: bool) {
        self.shared.balancer.complete_request(node_id, latency, success);
    }

    /// Promote `target` (or the best healthy non-leader) to leader.
    ///
    /// Returns `Ok(false)` when no eligible node exists.
    pub fn perform_failover(&self, target: Option<&str>) -> Result<bool> {
        if !self.shared.config.failover.enabled {
            warn!("Failover requested while disabled");
            return Err(Error::Precondition("failover is disabled".to_string()));
        }
        let mut state = self.shared.state.lock();
        let promoted = state.failover(target);
        self.publish_gauges(&state);
        Ok(promoted)
    }

    /// Scale the cluster towards `target_size` nodes.
    ///
    /// Scaling up only records intent; provisioning happens elsewhere and
    /// new nodes arrive through `add_node`. Scaling down removes the
    /// lowest-priority nodes other than the local node and the leader.
    pub fn scale_cluster(&self, target_size: usize) -> Result<bool> {
        let config = &self.shared.config;
        if target_size < config.min_nodes || target_size > config.max_nodes {
            return Err(Error::Precondition(format!(
                "target size {target_size} outside [{}, {}]",
                config.min_nodes, config.max_nodes
            )));
        }

        let removed = {
            let mut state = self.shared.state.lock();
            let current = state.nodes.len();

            let removed = match target_size.cmp(&current) {
                std::cmp::Ordering::Equal => return Ok(true),
                std::cmp::Ordering::Greater => {
                    state.desired_size = Some(target_size);
                    state.emit(
                        ClusterEvent::new(
                            ClusterEventType::ScalingUp,
                            Severity::Info,
                            format!("scaling up from {current} to {target_size} nodes"),
                        )
                        .with_meta("current", current)
                        .with_meta("target", target_size)
                        .with_meta("requested", target_size - current),
                    );
                    Vec::new()
                }
                std::cmp::Ordering::Less => {
                    let excess = current - target_size;
                    let keep = [state.local_node_id.as_deref(), state.leader.as_deref()];
                    let victims: Vec<(String, bool)> = election::removal_order(state.nodes.values(), &keep)
                        .into_iter()
                        .take(excess)
                        .map(|n| (n.id.clone(), n.is_available()))
                        .collect();

                    if victims.len() < excess {
                        return Err(Error::Precondition(format!(
                            "only {} nodes are eligible for removal, {excess} needed",
                            victims.len()
                        )));
                    }
                    let healthy_victims = victims.iter().filter(|(_, healthy)| *healthy).count();
                    if healthy_victims > 0 && state.healthy_count() - healthy_victims < config.min_nodes {
                        return Err(Error::Precondition(format!(
                            "scaling to {target_size} would leave fewer than {} healthy nodes",
                            config.min_nodes
                        )));
                    }

                    state.desired_size = Some(target_size);
                    state.emit(
                        ClusterEvent::new(
                            ClusterEventType::ScalingDown,
                            Severity::Info,
                            format!("scaling down from {current} to {target_size} nodes"),
                        )
                        .with_meta("current", current)
                        .with_meta("target", target_size)
                        .with_meta(
                            "nodes",
                            victims.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>(),
                        ),
                    );

                    let mut removed = Vec::with_capacity(victims.len());
                    for (node_id, _) in victims {
                        if state.remove(&node_id, config.min_nodes)?.is_some() {
                            self.shared.balancer.deregister_node(&node_id);
                            removed.push(node_id);
                        }
                    }
                    removed
                }
            };
            self.publish_gauges(&state);
            removed
        };

        for node_id in &removed {
            self.shared.timers.cancel(&health_timer(node_id));
        }
        self.shared.autoscaler.lock().record_action(Utc::now());
        info!(target = target_size, removed = removed.len(), "Cluster scaled");
        Ok(true)
    }

    /// Up to `limit` events, most recent first
    #[must_use]
    pub fn get_cluster_events(&self, limit: usize) -> Vec<ClusterEvent> {
        self.shared.state.lock().events.recent(limit)
    }

    /// Receive every event appended from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.shared.state.lock().events.subscribe()
    }

    /// Run one health-check cycle for a node.
    ///
    /// Returns the resulting health status, or `None` if the node is gone.
    pub async fn run_health_cycle(&self, node_id: &str) -> Option<HealthStatus> {
        let (checks, target) = {
            let state = self.shared.state.lock();
            let node = state.nodes.get(node_id)?;
            (node.health.checks.clone(), node.probe_target())
        };

        let results = self.shared.probes.run_checks(&target, &checks).await;

        let config = &self.shared.config;
        let threshold = config.failover.failure_threshold;
        let mut state = self.shared.state.lock();
        let node = state.nodes.get_mut(node_id)?;

        let previous = node.health.status;
        let score = health::score(&results);
        let status = HealthStatus::from_score(score);
        node.health.checks = results;
        node.health.score = score;
        node.health.status = status;
        node.health.last_checked = Some(Utc::now());

        let mut events = Vec::new();
        let mut marked_failed = false;
        if status == HealthStatus::Unhealthy {
            node.health.consecutive_failures += 1;
            let failures = node.health.consecutive_failures;
            if node.status != NodeStatus::Maintenance {
                if previous != HealthStatus::Unhealthy {
                    if node.status != NodeStatus::Failed {
                        node.status = NodeStatus::Unhealthy;
                    }
                    warn!(node_id = %node_id, score = score, "Node became unhealthy");
                    events.push(
                        ClusterEvent::new(
                            ClusterEventType::NodeFailed,
                            Severity::Error,
                            format!("node {node_id} is unhealthy (score {score:.0})"),
                        )
                        .with_node(node_id)
                        .with_meta("score", score),
                    );
                }
                if failures >= threshold && node.status != NodeStatus::Failed {
                    node.status = NodeStatus::Failed;
                    marked_failed = true;
                    error!(node_id = %node_id, failures = failures, "Node marked failed");
                }
            }
        } else {
            node.health.consecutive_failures = 0;
            if matches!(node.status, NodeStatus::Unhealthy | NodeStatus::Failed) {
                node.status = NodeStatus::Active;
                info!(node_id = %node_id, score = score, "Node recovered");
                events.push(
                    ClusterEvent::new(
                        ClusterEventType::NodeRecovered,
                        Severity::Info,
                        format!("node {node_id} recovered (score {score:.0})"),
                    )
                    .with_node(node_id)
                    .with_meta("score", score),
                );
            }
        }

        for event in events {
            state.emit(event);
        }

        if marked_failed && state.leader.as_deref() == Some(node_id) {
            let failover = &config.failover;
            let promoted = failover.enabled && failover.automatic && state.failover(None);
            if !promoted {
                state.elect();
            }
        }
        self.publish_gauges(&state);
        Some(status)
    }

    /// Consensus maintenance: re-elect if the leader is gone or unhealthy,
    /// and track whether the quorum is met
    pub fn run_consensus_tick(&self) {
        let mut state = self.shared.state.lock();
        if !state.leader_available() {
            state.elect();
        }

        let healthy = state.healthy_count();
        let quorum = self.shared.config.consensus.quorum_size;
        let met = healthy >= quorum;
        if met != state.quorum_met {
            state.quorum_met = met;
            if met {
                info!(healthy = healthy, quorum = quorum, "Quorum met");
            } else {
                warn!(healthy = healthy, quorum = quorum, "Quorum not met");
            }
        }
        self.publish_gauges(&state);
    }

    /// Run a full election among healthy nodes
    pub fn elect_leader(&self) -> Option<String> {
        self.shared.state.lock().elect()
    }

    /// Evaluate the auto-scaler once and apply its decision.
    ///
    /// Returns the decision only when `scale_cluster` accepted it.
    pub fn run_autoscaling(&self) -> Option<ScalingDecision> {
        let (size, metrics) = {
            let state = self.shared.state.lock();
            (state.nodes.len(), state.metrics(&self.shared.balancer, self.uptime()))
        };

        let decision = self.shared.autoscaler.lock().decide(
            Utc::now(),
            size,
            metrics.cpu_utilization,
            metrics.memory_utilization,
        )?;

        info!(
            direction = ?decision.direction,
            current = decision.current,
            target = decision.target,
            reason = %decision.reason,
            "Auto-scaling decision"
        );
        // A successful scale stamps the cooldown; a refused one is retried
        // on the next evaluation.
        match self.scale_cluster(decision.target) {
            Ok(_) => Some(decision),
            Err(e) => {
                warn!(error = %e, target = decision.target, "Auto-scaling action not applied");
                None
            }
        }
    }

    fn publish_gauges(&self, state: &ClusterState) {
        if !self.shared.config.monitoring.metrics_enabled {
            return;
        }
        CLUSTER_NODES.set(i64::try_from(state.nodes.len()).unwrap_or(i64::MAX));
        HEALTHY_NODES.set(i64::try_from(state.healthy_count()).unwrap_or(i64::MAX));
    }

    fn spawn_health_timer(&self, node_id: &str, period: Duration) {
        let weak = Arc::downgrade(&self.shared);
        let id = node_id.to_string();
        self.shared.timers.spawn(health_timer(node_id), period, move || {
            let weak = weak.clone();
            let id = id.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    ClusterManager { shared }.run_health_cycle(&id).await;
                }
            }
        });
    }

    fn spawn_consensus_timer(&self) {
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.config.consensus.heartbeat_interval();
        self.shared.timers.spawn(CONSENSUS_TIMER, period, move || {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    ClusterManager { shared }.run_consensus_tick();
                }
            }
        });
    }

    fn spawn_autoscale_timer(&self) {
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.config.auto_scaling.evaluation_interval();
        self.shared.timers.spawn(AUTOSCALE_TIMER, period, move || {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    ClusterManager { shared }.run_autoscaling();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::autoscaler::ScaleDirection;
    use crate::health::{CheckKind, CheckType, HealthCheck, HealthProbe, ProbeOutcome, ProbeTarget};
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Fails the custom check of every node whose id is in the set
    #[derive(Default)]
    struct SwitchProbe {
        failing: parking_lot::Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl HealthProbe for SwitchProbe {
        async fn execute(&self, target: &ProbeTarget, _: &HealthCheck) -> Result<ProbeOutcome> {
            if self.failing.lock().contains(&target.id) {
                Ok(ProbeOutcome::fail("down"))
            } else {
                Ok(ProbeOutcome::pass())
            }
        }
    }

    fn config(min_nodes: usize, max_nodes: usize) -> ClusterConfiguration {
        let mut config = ClusterConfiguration::default();
        config.min_nodes = min_nodes;
        config.max_nodes = max_nodes;
        config
    }

    fn manager_with_probe(config: ClusterConfiguration) -> (ClusterManager, Arc<SwitchProbe>) {
        let probe = Arc::new(SwitchProbe::default());
        let probes = ProbeRegistry::new().with_probe(CheckType::Custom, probe.clone());
        (ClusterManager::new(config, probes).unwrap(), probe)
    }

    fn checked_node(id: &str, role: NodeRole) -> NodeSpec {
        NodeSpec::new("10.0.0.1", 7400)
            .with_id(id)
            .with_role(role)
            .with_check(HealthCheck::new("probe", CheckKind::Custom { name: "probe".to_string() }))
    }

    fn event_types(manager: &ClusterManager) -> Vec<ClusterEventType> {
        let mut events = manager.get_cluster_events(usize::MAX);
        events.reverse();
        events.into_iter().map(|e| e.event_type).collect()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ClusterManager::new(config(5, 2), ProbeRegistry::new());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_first_node_becomes_leader() {
        let (manager, _) = manager_with_probe(config(1, 5));
        let node = manager.add_node(NodeSpec::new("10.0.0.1", 7400)).unwrap();
        assert_eq!(manager.leader(), Some(node.id));
        assert_eq!(manager.term(), 1);
        assert_eq!(
            event_types(&manager),
            vec![ClusterEventType::NodeJoined, ClusterEventType::LeaderElected]
        );
    }

    #[test]
    fn test_add_node_rejected_when_full() {
        let (manager, _) = manager_with_probe(config(1, 2));
        manager.add_node(NodeSpec::new("a", 1)).unwrap();
        manager.add_node(NodeSpec::new("b", 1)).unwrap();
        let result = manager.add_node(NodeSpec::new("c", 1));
        assert!(matches!(result, Err(Error::Precondition(_))));
        assert_eq!(manager.list_nodes().len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (manager, _) = manager_with_probe(config(1, 5));
        manager.add_node(NodeSpec::new("a", 1).with_id("n1")).unwrap();
        let result = manager.add_node(NodeSpec::new("b", 1).with_id("n1"));
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_remove_respects_min_nodes() {
        let (manager, _) = manager_with_probe(config(2, 5));
        manager.add_node(NodeSpec::new("a", 1).with_id("a")).unwrap();
        manager.add_node(NodeSpec::new("b", 1).with_id("b")).unwrap();

        let result = manager.remove_node("b");
        assert!(matches!(result, Err(Error::Precondition(_))));
        assert_eq!(manager.get_cluster_status().node_count, 2);

        assert!(!manager.remove_node("missing").unwrap());
    }

    #[test]
    fn test_remove_leader_triggers_election() {
        let (manager, _) = manager_with_probe(config(1, 5));
        manager.add_node(NodeSpec::new("a", 1).with_id("a").with_role(NodeRole::Primary)).unwrap();
        manager.add_node(NodeSpec::new("b", 1).with_id("b")).unwrap();
        assert_eq!(manager.leader().as_deref(), Some("a"));

        assert!(manager.remove_node("a").unwrap());
        assert_eq!(manager.leader().as_deref(), Some("b"));
        assert_eq!(manager.term(), 2);
        assert!(manager.get_node("a").is_none());
    }

    #[tokio::test]
    async fn test_failure_threshold_triggers_failover() {
        let (manager, probe) = manager_with_probe(config(1, 5));
        manager.add_node(checked_node("a", NodeRole::Primary)).unwrap();
        manager.add_node(checked_node("b", NodeRole::Secondary)).unwrap();
        probe.failing.lock().insert("a".to_string());

        for cycle in 1..=4 {
            assert_eq!(manager.run_health_cycle("a").await, Some(HealthStatus::Unhealthy));
            assert_eq!(manager.get_node("a").unwrap().status, NodeStatus::Unhealthy, "cycle {cycle}");
            assert_eq!(manager.leader().as_deref(), Some("a"));
        }

        manager.run_health_cycle("a").await;
        let failed = manager.get_node("a").unwrap();
        assert_eq!(failed.status, NodeStatus::Failed);
        assert_eq!(failed.health.consecutive_failures, 5);
        assert_eq!(failed.role, NodeRole::Secondary);
        assert_eq!(manager.leader().as_deref(), Some("b"));
        assert_eq!(manager.get_node("b").unwrap().role, NodeRole::Primary);

        let types = event_types(&manager);
        let node_failed: Vec<_> = types.iter().filter(|t| **t == ClusterEventType::NodeFailed).collect();
        assert_eq!(node_failed.len(), 1);
        assert!(types.ends_with(&[
            ClusterEventType::FailoverStarted,
            ClusterEventType::LeaderElected,
            ClusterEventType::FailoverCompleted,
        ]));
    }

    #[tokio::test]
    async fn test_recovery_emits_event() {
        let (manager, probe) = manager_with_probe(config(1, 5));
        manager.add_node(checked_node("a", NodeRole::Worker)).unwrap();

        probe.failing.lock().insert("a".to_string());
        manager.run_health_cycle("a").await;
        assert_eq!(manager.get_node("a").unwrap().status, NodeStatus::Unhealthy);

        probe.failing.lock().clear();
        assert_eq!(manager.run_health_cycle("a").await, Some(HealthStatus::Healthy));
        let node = manager.get_node("a").unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.health.consecutive_failures, 0);
        assert_eq!(
            manager.get_cluster_events(1)[0].event_type,
            ClusterEventType::NodeRecovered
        );
    }

    #[tokio::test]
    async fn test_consensus_lost_once_and_restored() {
        let (manager, probe) = manager_with_probe(config(1, 5));
        manager.add_node(checked_node("a", NodeRole::Worker)).unwrap();

        probe.failing.lock().insert("a".to_string());
        manager.run_health_cycle("a").await;
        manager.run_consensus_tick();
        manager.run_consensus_tick();
        assert!(manager.leader().is_none());

        let lost = manager
            .get_cluster_events(usize::MAX)
            .into_iter()
            .filter(|e| e.event_type == ClusterEventType::ConsensusLost)
            .collect::<Vec<_>>();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].severity, Severity::Critical);

        probe.failing.lock().clear();
        manager.run_health_cycle("a").await;
        manager.run_consensus_tick();
        assert_eq!(manager.leader().as_deref(), Some("a"));
        assert!(event_types(&manager).contains(&ClusterEventType::ConsensusRestored));
    }

    #[test]
    fn test_failover_disabled() {
        let mut config = config(1, 5);
        config.failover.enabled = false;
        let manager = ClusterManager::new(config, ProbeRegistry::new()).unwrap();
        manager.add_node(NodeSpec::new("a", 1)).unwrap();
        let before = manager.get_cluster_events(usize::MAX).len();

        assert!(matches!(manager.perform_failover(None), Err(Error::Precondition(_))));
        assert_eq!(manager.get_cluster_events(usize::MAX).len(), before);
    }

    #[test]
    fn test_failover_without_target() {
        let (manager, _) = manager_with_probe(config(1, 5));
        manager.add_node(NodeSpec::new("a", 1).with_id("a")).unwrap();

        assert!(!manager.perform_failover(None).unwrap());
        let last = &manager.get_cluster_events(1)[0];
        assert_eq!(last.event_type, ClusterEventType::FailoverCompleted);
        assert_eq!(last.metadata["success"], false);
        assert_eq!(manager.leader().as_deref(), Some("a"));
    }

    #[test]
    fn test_failover_to_explicit_target() {
        let (manager, _) = manager_with_probe(config(1, 5));
        manager.add_node(NodeSpec::new("a", 1).with_id("a").with_role(NodeRole::Primary)).unwrap();
        manager.add_node(NodeSpec::new("b", 1).with_id("b").with_role(NodeRole::Observer)).unwrap();
        manager.add_node(NodeSpec::new("c", 1).with_id("c").with_role(NodeRole::Secondary)).unwrap();

        assert!(manager.perform_failover(Some("b")).unwrap());
        assert_eq!(manager.leader().as_deref(), Some("b"));
        assert_eq!(manager.get_node("b").unwrap().role, NodeRole::Primary);
        assert_eq!(manager.get_node("a").unwrap().role, NodeRole::Secondary);

        // The maintenance tick keeps a healthy leader
        manager.run_consensus_tick();
        assert_eq!(manager.leader().as_deref(), Some("b"));
    }

    #[test]
    fn test_maintenance_leaves_routing_and_leadership() {
        let (manager, _) = manager_with_probe(config(1, 5));
        manager.add_node(NodeSpec::new("a", 1).with_id("a").with_role(NodeRole::Primary)).unwrap();
        manager.add_node(NodeSpec::new("b", 1).with_id("b")).unwrap();

        assert!(manager.set_maintenance("a", true));
        assert_eq!(manager.leader().as_deref(), Some("b"));
        for _ in 0..4 {
            let routed = manager.route_request(&RouteRequest::default()).unwrap();
            assert_eq!(routed.id, "b");
        }

        assert!(manager.set_maintenance("a", false));
        assert_eq!(manager.get_node("a").unwrap().status, NodeStatus::Active);
        assert!(!manager.set_maintenance("missing", true));
    }

    #[test]
    fn test_scale_cluster() {
        let (manager, _) = manager_with_probe(config(1, 4));
        manager.add_node(NodeSpec::new("a", 1).with_id("a").with_role(NodeRole::Primary)).unwrap();
        manager.add_node(NodeSpec::new("b", 1).with_id("b").with_role(NodeRole::Observer)).unwrap();
        manager.add_node(NodeSpec::new("c", 1).with_id("c").with_role(NodeRole::Secondary)).unwrap();

        assert!(matches!(manager.scale_cluster(5), Err(Error::Precondition(_))));
        assert!(matches!(manager.scale_cluster(0), Err(Error::Precondition(_))));
        assert!(manager.scale_cluster(3).unwrap());

        assert!(manager.scale_cluster(4).unwrap());
        assert_eq!(manager.get_cluster_events(1)[0].event_type, ClusterEventType::ScalingUp);
        assert_eq!(manager.get_cluster_status().desired_size, Some(4));

        assert!(manager.scale_cluster(2).unwrap());
        let remaining: Vec<String> = manager.list_nodes().into_iter().map(|n| n.id).collect();
        assert_eq!(remaining, vec!["a".to_string(), "c".to_string()]);
        assert!(event_types(&manager).contains(&ClusterEventType::ScalingDown));
    }

    fn autoscaling_config() -> ClusterConfiguration {
        let mut config = config(1, 4);
        config.auto_scaling.enabled = true;
        config.auto_scaling.min_replicas = 1;
        config.auto_scaling.max_replicas = 4;
        config
    }

    fn set_usage(manager: &ClusterManager, node_id: &str, cpu: f64, memory: f64) {
        let mut resources = NodeResources::default();
        resources.cpu.usage = cpu;
        resources.memory.usage = memory;
        assert!(manager.update_node_resources(node_id, resources));
    }

    #[test]
    fn test_autoscaling_scales_up_then_cools_down() {
        let (manager, _) = manager_with_probe(autoscaling_config());
        manager.add_node(NodeSpec::new("a", 1).with_id("a").with_role(NodeRole::Primary)).unwrap();
        manager.add_node(NodeSpec::new("b", 1).with_id("b").with_role(NodeRole::Worker)).unwrap();
        set_usage(&manager, "a", 95.0, 40.0);
        set_usage(&manager, "b", 85.0, 40.0);

        let decision = manager.run_autoscaling().unwrap();
        assert_eq!(decision.direction, ScaleDirection::Up);
        assert_eq!((decision.current, decision.target), (2, 3));
        assert_eq!(manager.get_cluster_status().desired_size, Some(3));
        assert_eq!(manager.get_cluster_events(1)[0].event_type, ClusterEventType::ScalingUp);

        let events = manager.get_cluster_events(usize::MAX).len();
        assert!(manager.run_autoscaling().is_none());
        assert_eq!(manager.get_cluster_events(usize::MAX).len(), events);
    }

    #[test]
    fn test_autoscaling_removes_lowest_priority_node() {
        let (manager, _) = manager_with_probe(autoscaling_config());
        manager.add_node(NodeSpec::new("a", 1).with_id("a").with_role(NodeRole::Primary)).unwrap();
        manager.add_node(NodeSpec::new("b", 1).with_id("b").with_role(NodeRole::Observer)).unwrap();
        manager.add_node(NodeSpec::new("c", 1).with_id("c").with_role(NodeRole::Secondary)).unwrap();
        for id in ["a", "b", "c"] {
            set_usage(&manager, id, 10.0, 20.0);
        }

        let decision = manager.run_autoscaling().unwrap();
        assert_eq!(decision.direction, ScaleDirection::Down);
        assert_eq!(decision.target, 2);

        let remaining: Vec<String> = manager.list_nodes().into_iter().map(|n| n.id).collect();
        assert_eq!(remaining, vec!["a".to_string(), "c".to_string()]);
        assert!(event_types(&manager).contains(&ClusterEventType::ScalingDown));
        assert!(manager.run_autoscaling().is_none());
        assert_eq!(manager.list_nodes().len(), 2);
    }

    #[test]
    fn test_autoscaling_idle_within_thresholds() {
        let (manager, _) = manager_with_probe(autoscaling_config());
        manager.add_node(NodeSpec::new("a", 1).with_id("a")).unwrap();
        manager.add_node(NodeSpec::new("b", 1).with_id("b")).unwrap();
        set_usage(&manager, "a", 50.0, 50.0);
        set_usage(&manager, "b", 60.0, 20.0);

        assert!(manager.run_autoscaling().is_none());
        assert_eq!(manager.get_cluster_status().desired_size, None);
        assert_eq!(manager.list_nodes().len(), 2);
    }

    #[test]
    fn test_metrics_and_request_tracking() {
        let (manager, _) = manager_with_probe(config(1, 5));
        let mut busy = NodeResources::default();
        busy.cpu.usage = 60.0;
        busy.memory.usage = 40.0;
        busy.network.inbound = 10.0;
        busy.network.outbound = 5.0;
        let a = manager.add_node(NodeSpec::new("a", 1).with_resources(busy)).unwrap();
        manager.add_node(NodeSpec::new("b", 1)).unwrap();

        manager.begin_request(&a.id);
        manager.complete_request(&a.id, Duration::from_millis(40), false);

        let metrics = manager.get_cluster_metrics();
        assert_eq!(metrics.node_count, 2);
        assert_eq!(metrics.active_nodes, 2);
        assert!((metrics.cpu_utilization - 30.0).abs() < 1e-9);
        assert!((metrics.memory_utilization - 20.0).abs() < 1e-9);
        assert!((metrics.network_throughput - 15.0).abs() < 1e-9);
        assert!((metrics.availability - 100.0).abs() < 1e-9);
        assert!((metrics.error_rate - 100.0).abs() < 1e-9);
        assert!((metrics.average_latency_ms - 40.0).abs() < 1e-9);

        manager.record_request_metrics(RequestMetrics {
            request_rate: 12.0,
            average_latency_ms: 8.0,
            error_rate: 0.5,
        });
        let metrics = manager.get_cluster_metrics();
        assert!((metrics.request_rate - 12.0).abs() < f64::EPSILON);
        assert!((metrics.error_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (manager, _) = manager_with_probe(config(1, 5));
        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert!(manager.is_running());

        let local = manager.local_node_id().unwrap();
        assert_eq!(manager.get_node(&local).unwrap().role, NodeRole::Primary);
        assert_eq!(manager.leader(), Some(local.clone()));

        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());
        assert!(manager.get_node(&local).is_none());

        let last = &manager.get_cluster_events(2);
        assert!(last.iter().any(|e| {
            e.event_type == ClusterEventType::NodeLeft && e.node_id.as_deref() == Some(local.as_str())
        }));
    }
}
