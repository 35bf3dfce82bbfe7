//! Service instance records and discovery queries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::coordination::deadline;
use crate::health::{HealthCheck, ProbeTarget};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Tcp,
    Udp,
    Grpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl ServiceHealthStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: ServiceHealthStatus,
    pub checks: Vec<HealthCheck>,
    pub last_updated: DateTime<Utc>,
}

/// A registered, named endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    pub tags: BTreeSet<String>,
    pub metadata: HashMap<String, String>,
    pub health: ServiceHealth,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ttl: Duration,
}

impl ServiceInstance {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health.status == ServiceHealthStatus::Healthy
    }

    /// Heartbeat overdue: reported critical on the next health check
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > deadline(self.last_heartbeat, self.ttl)
    }

    /// Silent for more than twice the TTL: swept by cleanup
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > deadline(self.last_heartbeat, self.ttl.saturating_mul(2))
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
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

/// Registration request; the registry assigns id and timestamps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    /// Registry default when unset
    #[serde(default)]
    pub ttl: Option<Duration>,
}

impl ServiceRegistration {
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Discovery filter; every set field must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceQuery {
    pub service_name: Option<String>,
    /// All listed tags must be present
    #[serde(default)]
    pub tags: Vec<String>,
    /// `Some(true)` keeps only healthy instances, `Some(false)` only the rest
    pub healthy: Option<bool>,
    /// Exact key/value matches
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceQuery {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            service_name: Some(name.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub const fn healthy_only(mut self) -> Self {
        self.healthy = Some(true);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        if self.service_name.as_deref().is_some_and(|n| n != instance.name) {
            return false;
        }
        if self.healthy.is_some_and(|h| h != instance.is_healthy()) {
            return false;
        }
        if !self.tags.iter().all(|t| instance.tags.contains(t)) {
            return false;
        }
        self.metadata
            .iter()
            .all(|(k, v)| instance.metadata.get(k) == Some(v))
    }
}
