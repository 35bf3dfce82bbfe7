//! Cluster coordination core
//!
//! Node membership with health monitoring, leader election and failover,
//! request routing, auto-scaling, a service registry and coordination
//! primitives (locks, semaphores, barriers, queues, elections).

pub mod balancer;
pub mod cluster;
pub mod coordination;
pub mod discovery;
pub mod error;
pub mod health;
pub mod timers;

pub use balancer::{LoadBalancer, RouteRequest, SelectionStrategy};
pub use cluster::{
    ClusterEvent, ClusterEventType, ClusterManager, ClusterMetrics, ClusterNode, ClusterStatus,
    NodeSpec, NodeStatus,
};
pub use coordination::CoordinationPrimitive;
pub use discovery::{
    DiscoveryEvent, ServiceChange, ServiceDiscoveryManager, ServiceInstance, ServiceQuery,
    ServiceRegistration,
};
pub use error::{Error, Result};
pub use health::{HealthCheck, HealthProbe, HealthStatus, ProbeRegistry};
