use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instance::{ServiceHealthStatus, ServiceInstance};

/// Change delivered to watchers of one service name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ServiceChange {
    Registered {
        instance: ServiceInstance,
    },
    Deregistered {
        instance: ServiceInstance,
        /// Removed by the TTL sweep rather than explicitly
        expired: bool,
    },
    HealthChanged {
        instance: ServiceInstance,
        previous: ServiceHealthStatus,
    },
}

impl ServiceChange {
    #[must_use]
    pub const fn instance(&self) -> &ServiceInstance {
        match self {
            Self::Registered { instance }
            | Self::Deregistered { instance, .. }
            | Self::HealthChanged { instance, .. } => instance,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Deregistered { expired: false, .. } => "deregistered",
            Self::Deregistered { expired: true, .. } => "expired",
            Self::HealthChanged { .. } => "health_changed",
        }
    }
}

/// Registry and coordination events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    ServiceRegistered {
        name: String,
        instance_id: String,
        endpoint: String,
        timestamp: DateTime<Utc>,
    },

    ServiceDeregistered {
        name: String,
        instance_id: String,
        expired: bool,
        timestamp: DateTime<Utc>,
    },

    ServiceHealthChanged {
        name: String,
        instance_id: String,
        previous: ServiceHealthStatus,
        current: ServiceHealthStatus,
        timestamp: DateTime<Utc>,
    },

    LockAcquired {
        lock_id: String,
        owner: String,
        expires_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },

    LockReleased {
        lock_id: String,
        owner: String,
        timestamp: DateTime<Utc>,
    },

    /// Ownership dropped by the cleanup sweep
    LockExpired {
        lock_id: String,
        timestamp: DateTime<Utc>,
    },

    PermitAcquired {
        semaphore_id: String,
        holder: String,
        available: u32,
        timestamp: DateTime<Utc>,
    },

    PermitReleased {
        semaphore_id: String,
        holder: String,
        available: u32,
        timestamp: DateTime<Utc>,
    },

    /// Fired once per barrier
    BarrierReleased {
        barrier_id: String,
        participants: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    LeaderElected {
        election_id: String,
        leader: Option<String>,
        term: u64,
        timestamp: DateTime<Utc>,
    },
}

impl DiscoveryEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceRegistered { .. } => "service_registered",
            Self::ServiceDeregistered { .. } => "service_deregistered",
            Self::ServiceHealthChanged { .. } => "service_health_changed",
            Self::LockAcquired { .. } => "lock_acquired",
            Self::LockReleased { .. } => "lock_released",
            Self::LockExpired { .. } => "lock_expired",
            Self::PermitAcquired { .. } => "permit_acquired",
            Self::PermitReleased { .. } => "permit_released",
            Self::BarrierReleased { .. } => "barrier_released",
            Self::LeaderElected { .. } => "leader_elected",
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::ServiceRegistered { timestamp, .. }
            | Self::ServiceDeregistered { timestamp, .. }
            | Self::ServiceHealthChanged { timestamp, .. }
            | Self::LockAcquired { timestamp, .. }
            | Self::LockReleased { timestamp, .. }
            | Self::LockExpired { timestamp, .. }
            | Self::PermitAcquired { timestamp, .. }
            | Self::PermitReleased { timestamp, .. }
            | Self::BarrierReleased { timestamp, .. }
            | Self::LeaderElected { timestamp, .. } => timestamp,
        }
    }

    /// Service name for registry events
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        match self {
            Self::ServiceRegistered { name, .. }
            | Self::ServiceDeregistered { name, .. }
            | Self::ServiceHealthChanged { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }
}
