//! Cluster membership, leader election, failover and scaling

pub mod autoscaler;
pub mod election;
pub mod events;
pub mod manager;
pub mod node;

pub use autoscaler::{AutoScaler, ScaleDirection, ScalingDecision};
pub use events::{ClusterEvent, ClusterEventType, EventLog, Severity};
pub use manager::{ClusterManager, ClusterMetrics, ClusterStatus, RequestMetrics};
pub use node::{
    CapacityGauge, ClusterNode, CpuResources, NetworkResources, NodeHealth, NodeResources, NodeSpec,
    NodeStatus,
};
