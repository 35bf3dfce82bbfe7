//! Probe contract and check execution
//!
//! The engine does not know how to reach an HTTP endpoint or run a script.
//! Embedders register one [`HealthProbe`] per [`CheckType`]; the engine
//! applies timeouts, retries and error capture around them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::check::{CheckKind, CheckStatus, CheckType, HealthCheck};
use crate::error::{Error, Result};
use meridian_core::metrics::cluster::HEALTH_CHECK_DURATION;

/// The entity a check runs against
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub last_heartbeat: DateTime<Utc>,
}

/// Result reported by a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: CheckStatus,
    pub output: Option<String>,
}

impl ProbeOutcome {
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            status: CheckStatus::Pass,
            output: None,
        }
    }

    #[must_use]
    pub fn warn(output: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warn,
            output: Some(output.into()),
        }
    }

    #[must_use]
    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            output: Some(output.into()),
        }
    }
}

/// Executes one type of health check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn execute(&self, target: &ProbeTarget, check: &HealthCheck) -> Result<ProbeOutcome>;
}

/// Heartbeat-based check: passes while the last heartbeat is within the TTL
#[derive(Debug, Clone, Copy, Default)]
pub struct TtlProbe;

#[async_trait]
impl HealthProbe for TtlProbe {
    async fn execute(&self, target: &ProbeTarget, check: &HealthCheck) -> Result<ProbeOutcome> {
        let CheckKind::Ttl { ttl } = &check.kind else {
            return Err(Error::Probe(format!(
                "ttl probe cannot run a {} check",
                check.check_type()
            )));
        };

        let silence = Utc::now().signed_duration_since(target.last_heartbeat);
        let ttl = chrono::Duration::from_std(*ttl)
            .map_err(|e| Error::Probe(format!("ttl out of range: {e}")))?;

        if silence > ttl {
            Ok(ProbeOutcome::fail(format!(
                "no heartbeat for {}ms (ttl {}ms)",
                silence.num_milliseconds(),
                ttl.num_milliseconds()
            )))
        } else {
            Ok(ProbeOutcome::pass())
        }
    }
}

/// Probes keyed by check type
#[derive(Clone)]
pub struct ProbeRegistry {
    probes: HashMap<CheckType, Arc<dyn HealthProbe>>,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeRegistry {
    /// Registry with the built-in TTL probe
    #[must_use]
    pub fn new() -> Self {
        Self::empty().with_probe(CheckType::Ttl, Arc::new(TtlProbe))
    }

    /// Registry without any probe
    #[must_use]
    pub fn empty() -> Self {
        Self {
            probes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_probe(mut self, check_type: CheckType, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.insert(check_type, probe);
        self
    }

    pub fn register(&mut self, check_type: CheckType, probe: Arc<dyn HealthProbe>) {
        self.probes.insert(check_type, probe);
    }

    #[must_use]
    pub fn get(&self, check_type: CheckType) -> Option<&Arc<dyn HealthProbe>> {
        self.probes.get(&check_type)
    }

    /// Run one check, applying its timeout and retry budget.
    ///
    /// Never fails: probe errors, panics, timeouts and missing probes are
    /// recorded as a `fail` verdict with the reason as output.
    pub async fn run_check(&self, target: &ProbeTarget, check: &HealthCheck) -> HealthCheck {
        let started = Instant::now();
        let check_type = check.check_type();

        let mut outcome = ProbeOutcome::fail(format!("no probe registered for {check_type}"));
        if let Some(probe) = self.get(check_type) {
            for attempt in 0..=check.retries {
                let attempt_future = tokio::time::timeout(check.timeout, probe.execute(target, check));
                outcome = match AssertUnwindSafe(attempt_future).catch_unwind().await {
                    Ok(Ok(Ok(outcome))) => outcome,
                    Ok(Ok(Err(e))) => ProbeOutcome::fail(e.to_string()),
                    Ok(Err(_)) => ProbeOutcome::fail(
                        Error::Timeout(format!("no verdict after {}ms", check.timeout.as_millis()))
                            .to_string(),
                    ),
                    Err(panic) => {
                        tracing::warn!(
                            target_id = %target.id,
                            check = %check.name,
                            "Health probe panicked"
                        );
                        ProbeOutcome::fail(Error::Probe(panic_message(panic.as_ref())).to_string())
                    }
                };
                if outcome.status != CheckStatus::Fail {
                    break;
                }
                if attempt < check.retries {
                    tracing::debug!(
                        target_id = %target.id,
                        check = %check.name,
                        attempt = attempt + 1,
                        "Health check failed, retrying"
                    );
                }
            }
        }

        let elapsed = started.elapsed();
        HEALTH_CHECK_DURATION
            .with_label_values(&[check_type.as_str(), outcome.status.as_str()])
            .observe(elapsed.as_secs_f64());

        if outcome.status == CheckStatus::Fail {
            tracing::debug!(
                target_id = %target.id,
                check = %check.name,
                output = outcome.output.as_deref().unwrap_or_default(),
                "Health check failed"
            );
        }

        let mut updated = check.clone();
        updated.status = Some(outcome.status);
        updated.output = outcome.output;
        updated.last_checked = Some(Utc::now());
        updated.duration = Some(elapsed);
        updated
    }

    /// Run every check of one entity concurrently, preserving check order
    pub async fn run_checks(&self, target: &ProbeTarget, checks: &[HealthCheck]) -> Vec<HealthCheck> {
        futures::future::join_all(checks.iter().map(|check| self.run_check(target, check))).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("probe panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("probe panicked: {msg}")
    } else {
        "probe panicked".to_string()
    }
}

/// Shortest interval among a set of checks, falling back to `default`
#[must_use]
pub fn cycle_interval(checks: &[HealthCheck], default: Duration) -> Duration {
    checks
        .iter()
        .map(|c| c.interval)
        .filter(|d| !d.is_zero())
        .min()
        .unwrap_or(default)
}
