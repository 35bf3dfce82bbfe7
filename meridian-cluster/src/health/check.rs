//! Health check definitions shared by cluster nodes and service instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Score at or above which an entity is healthy
pub const HEALTHY_SCORE: f64 = 80.0;
/// Score at or above which an entity is degraded rather than unhealthy
pub const DEGRADED_SCORE: f64 = 60.0;

/// Check type discriminant, used to look up the probe that executes a check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Http,
    Tcp,
    Script,
    Custom,
    Ttl,
}

impl CheckType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Script => "script",
            Self::Custom => "custom",
            Self::Ttl => "ttl",
        }
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific parameters of a health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    Http {
        url: String,
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        expected_status: u16,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Script {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Checked by an embedder-supplied probe registered for `CheckType::Custom`
    Custom {
        name: String,
    },
    /// Passes while the target has sent a heartbeat within `ttl`
    Ttl {
        ttl: Duration,
    },
}

impl CheckKind {
    #[must_use]
    pub const fn check_type(&self) -> CheckType {
        match self {
            Self::Http { .. } => CheckType::Http,
            Self::Tcp { .. } => CheckType::Tcp,
            Self::Script { .. } => CheckType::Script,
            Self::Custom { .. } => CheckType::Custom,
            Self::Ttl { .. } => CheckType::Ttl,
        }
    }
}

/// Verdict of a single check execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

/// A health check and the outcome of its most recent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub id: String,
    pub name: String,
    pub kind: CheckKind,
    pub interval: Duration,
    pub timeout: Duration,
    /// Additional attempts after a failed run
    pub retries: u32,
    /// `None` until the check has run once
    pub status: Option<CheckStatus>,
    pub output: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

impl HealthCheck {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            id: format!("chk_{}", nanoid::nanoid!(8)),
            name: name.into(),
            kind,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            retries: 0,
            status: None,
            output: None,
            last_checked: None,
            duration: None,
        }
    }

    /// TTL check that fails once no heartbeat arrived within `ttl`
    #[must_use]
    pub fn ttl(ttl: Duration) -> Self {
        Self::new("ttl", CheckKind::Ttl { ttl })
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn check_type(&self) -> CheckType {
        self.kind.check_type()
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == Some(CheckStatus::Pass)
    }
}

/// Health classification derived from a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= HEALTHY_SCORE {
            Self::Healthy
        } else if score >= DEGRADED_SCORE {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Percentage of passing checks; an entity without checks scores 100
#[must_use]
pub fn score(checks: &[HealthCheck]) -> f64 {
    if checks.is_empty() {
        return 100.0;
    }
    let passed = checks.iter().filter(|c| c.passed()).count();
    100.0 * passed as f64 / checks.len() as f64
}
