//! Cluster event stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;

use meridian_core::metrics::cluster::CLUSTER_EVENTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterEventType {
    NodeJoined,
    NodeLeft,
    NodeFailed,
    NodeRecovered,
    NodeMaintenance,
    LeaderElected,
    FailoverStarted,
    FailoverCompleted,
    ScalingUp,
    ScalingDown,
    ConsensusLost,
    ConsensusRestored,
}

impl ClusterEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NodeJoined => "node_joined",
            Self::NodeLeft => "node_left",
            Self::NodeFailed => "node_failed",
            Self::NodeRecovered => "node_recovered",
            Self::NodeMaintenance => "node_maintenance",
            Self::LeaderElected => "leader_elected",
            Self::FailoverStarted => "failover_started",
            Self::FailoverCompleted => "failover_completed",
            Self::ScalingUp => "scaling_up",
            Self::ScalingDown => "scaling_down",
            Self::ConsensusLost => "consensus_lost",
            Self::ConsensusRestored => "consensus_restored",
        }
    }
}

/// Event severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// An entry of the cluster event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub id: String,
    pub event_type: ClusterEventType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub node_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ClusterEvent {
    #[must_use]
    pub fn new(event_type: ClusterEventType, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: format!("evt_{}", nanoid::nanoid!(12)),
            event_type,
            severity,
            timestamp: Utc::now(),
            node_id: None,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Bounded, append-only event log that also fans out to subscribers
pub struct EventLog {
    entries: VecDeque<ClusterEvent>,
    capacity: usize,
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.clamp(16, 1024));
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            tx,
        }
    }

    pub fn append(&mut self, event: ClusterEvent) {
        CLUSTER_EVENTS
            .with_label_values(&[event.event_type.as_str(), event.severity.as_str()])
            .inc();

        // No receivers is fine
        let _ = self.tx.send(event.clone());

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    /// Up to `limit` events, most recent first
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<ClusterEvent> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
