//! Cluster node records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::health::{HealthCheck, HealthStatus, ProbeTarget};
use meridian_core::config::NodeRole;

const GIB: u64 = 1024 * 1024 * 1024;

/// Membership status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Standby,
    Unhealthy,
    Failed,
    Maintenance,
}

impl NodeStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Standby => "standby",
            Self::Unhealthy => "unhealthy",
            Self::Failed => "failed",
            Self::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuResources {
    pub cores: u32,
    /// Percent, 0-100
    pub usage: f64,
}

/// Capacity gauge for memory and storage, in bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityGauge {
    pub total: u64,
    pub used: u64,
    /// Percent, 0-100
    pub usage: f64,
}

impl CapacityGauge {
    #[must_use]
    pub const fn empty(total: u64) -> Self {
        Self {
            total,
            used: 0,
            usage: 0.0,
        }
    }
}

/// Network gauges, in megabits per second
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkResources {
    pub bandwidth: u64,
    pub inbound: f64,
    pub outbound: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpu: CpuResources,
    pub memory: CapacityGauge,
    pub storage: CapacityGauge,
    pub network: NetworkResources,
}

impl Default for NodeResources {
    fn default() -> Self {
        Self {
            cpu: CpuResources {
                cores: 4,
                usage: 0.0,
            },
            memory: CapacityGauge::empty(8 * GIB),
            storage: CapacityGauge::empty(100 * GIB),
            network: NetworkResources {
                bandwidth: 1000,
                inbound: 0.0,
                outbound: 0.0,
            },
        }
    }
}

/// Health state of a node, owned by its health-check cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub score: f64,
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
}

impl NodeHealth {
    #[must_use]
    pub const fn new(checks: Vec<HealthCheck>) -> Self {
        Self {
            score: 100.0,
            status: HealthStatus::Healthy,
            checks,
            consecutive_failures: 0,
            last_checked: None,
        }
    }
}

/// A cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub address: String,
    pub port: u16,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub metadata: HashMap<String, String>,
    pub resources: NodeResources,
    pub health: NodeHealth,
    pub last_heartbeat: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
}

impl ClusterNode {
    /// Active and healthy: eligible for routing and leadership
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Active && self.health.status == HealthStatus::Healthy
    }

    /// Election priority: role weight + score + idle cpu + idle memory
    #[must_use]
    pub fn priority(&self) -> f64 {
        self.role.election_weight()
            + self.health.score
            + (100.0 - self.resources.cpu.usage)
            + (100.0 - self.resources.memory.usage)
    }

    /// Load-balancer weight from `metadata["weight"]`, default 1
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.metadata
            .get("weight")
            .and_then(|w| w.parse().ok())
            .unwrap_or(1)
    }

    #[must_use]
    pub fn probe_target(&self) -> ProbeTarget {
        ProbeTarget {
            id: self.id.clone(),
            address: self.address.clone(),
            port: self.port,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Partial node description passed to `add_node`; unset fields get defaults
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub id: Option<String>,
    pub role: Option<NodeRole>,
    pub status: Option<NodeStatus>,
    pub address: String,
    pub port: u16,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub metadata: HashMap<String, String>,
    pub resources: Option<NodeResources>,
    pub checks: Vec<HealthCheck>,
}

impl NodeSpec {
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub const fn with_role(mut self, role: NodeRole) -> Self {
        self.role = Some(role);
        self
    }

    #[must_use]
    pub fn with_resources(mut self, resources: NodeResources) -> Self {
        self.resources = Some(resources);
        self
    }

    #[must_use]
    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub(crate) fn build(self, now: DateTime<Utc>) -> ClusterNode {
        ClusterNode {
            id: self
                .id
                .unwrap_or_else(|| format!("node_{}", nanoid::nanoid!(12))),
            role: self.role.unwrap_or_default(),
            status: self.status.unwrap_or(NodeStatus::Active),
            address: self.address,
            port: self.port,
            region: self.region,
            zone: self.zone,
            capabilities: self.capabilities,
            metadata: self.metadata,
            resources: self.resources.unwrap_or_default(),
            health: NodeHealth::new(self.checks),
            last_heartbeat: now,
            joined_at: now,
        }
    }
}
