//! Threshold-based auto-scaling decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meridian_core::config::AutoScalingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub direction: ScaleDirection,
    pub current: usize,
    pub target: usize,
    pub reason: String,
}

/// Evaluates utilization against the configured thresholds.
///
/// At most one step of one node per evaluation, and none while the
/// cooldown since the last scaling action is running.
#[derive(Debug, Clone)]
pub struct AutoScaler {
    config: AutoScalingConfig,
    last_action: Option<DateTime<Utc>>,
}

impl AutoScaler {
    #[must_use]
    pub const fn new(config: AutoScalingConfig) -> Self {
        Self {
            config,
            last_action: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AutoScalingConfig {
        &self.config
    }

    #[must_use]
    pub const fn last_action(&self) -> Option<DateTime<Utc>> {
        self.last_action
    }

    /// Start the cooldown window at `now`
    pub fn record_action(&mut self, now: DateTime<Utc>) {
        self.last_action = Some(now);
    }

    #[must_use]
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_action else {
            return false;
        };
        let cooldown = chrono::Duration::from_std(self.config.cooldown()).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(last) < cooldown
    }

    /// Decide whether to scale given the average cpu and memory usage in
    /// percent. A decision starts the cooldown.
    pub fn evaluate(
        &mut self,
        now: DateTime<Utc>,
        size: usize,
        cpu: f64,
        memory: f64,
    ) -> Option<ScalingDecision> {
        let decision = self.decide(now, size, cpu, memory)?;
        self.record_action(now);
        Some(decision)
    }

    /// Same as [`evaluate`](Self::evaluate) without starting the cooldown;
    /// the caller records the action once it has been applied.
    #[must_use]
    pub fn decide(
        &self,
        now: DateTime<Utc>,
        size: usize,
        cpu: f64,
        memory: f64,
    ) -> Option<ScalingDecision> {
        if self.in_cooldown(now) {
            return None;
        }

        let up = self.config.scale_up_threshold;
        let down = self.config.scale_down_threshold;

        let decision = if size < self.config.max_replicas && (cpu > up || memory > up) {
            ScalingDecision {
                direction: ScaleDirection::Up,
                current: size,
                target: size + 1,
                reason: format!("utilization above {up}% (cpu {cpu:.1}%, memory {memory:.1}%)"),
            }
        } else if size > self.config.min_replicas && cpu < down && memory < down {
            ScalingDecision {
                direction: ScaleDirection::Down,
                current: size,
                target: size - 1,
                reason: format!("utilization below {down}% (cpu {cpu:.1}%, memory {memory:.1}%)"),
            }
        } else {
            return None;
        };

        Some(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler() -> AutoScaler {
        AutoScaler::new(AutoScalingConfig {
            enabled: true,
            min_replicas: 2,
            max_replicas: 4,
            scale_up_threshold: 80.0,
            scale_down_threshold: 30.0,
            cooldown_secs: 300,
            evaluation_interval_secs: 60,
        })
    }

    #[test]
    fn test_scale_up_on_either_metric() {
        let now = Utc::now();
        let decision = scaler().evaluate(now, 3, 85.0, 10.0).unwrap();
        assert_eq!(decision.direction, ScaleDirection::Up);
        assert_eq!(decision.target, 4);

        let decision = scaler().evaluate(now, 3, 10.0, 90.0).unwrap();
        assert_eq!(decision.direction, ScaleDirection::Up);
    }

    #[test]
    fn test_scale_down_needs_both_metrics() {
        let now = Utc::now();
        let decision = scaler().evaluate(now, 3, 10.0, 20.0).unwrap();
        assert_eq!(decision.direction, ScaleDirection::Down);
        assert_eq!(decision.target, 2);

        assert!(scaler().evaluate(now, 3, 10.0, 50.0).is_none());
    }

    #[test]
    fn test_replica_bounds() {
        let now = Utc::now();
        assert!(scaler().evaluate(now, 4, 99.0, 99.0).is_none());
        assert!(scaler().evaluate(now, 2, 0.0, 0.0).is_none());
    }

    #[test]
    fn test_thresholds_are_strict() {
        let now = Utc::now();
        assert!(scaler().evaluate(now, 3, 80.0, 80.0).is_none());
        assert!(scaler().evaluate(now, 3, 30.0, 10.0).is_none());
    }

    #[test]
    fn test_cooldown() {
        let t0 = Utc::now();
        let mut scaler = scaler();
        assert!(scaler.evaluate(t0, 3, 90.0, 0.0).is_some());
        assert_eq!(scaler.last_action(), Some(t0));

        let during = t0 + chrono::Duration::seconds(299);
        assert!(scaler.evaluate(during, 3, 90.0, 0.0).is_none());

        let after = t0 + chrono::Duration::seconds(300);
        assert!(scaler.evaluate(after, 3, 90.0, 0.0).is_some());
    }

    #[test]
    fn test_decide_leaves_cooldown_to_caller() {
        let now = Utc::now();
        let scaler = scaler();
        assert!(scaler.decide(now, 3, 90.0, 0.0).is_some());
        assert!(scaler.last_action().is_none());
        assert!(scaler.decide(now, 3, 90.0, 0.0).is_some());
    }

    #[test]
    fn test_no_decision_keeps_cooldown_clear() {
        let now = Utc::now();
        let mut scaler = scaler();
        assert!(scaler.evaluate(now, 3, 50.0, 50.0).is_none());
        assert!(scaler.last_action().is_none());
    }
}
