use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub cluster: ClusterConfiguration,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json", "pretty" or "compact"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Deployment shape of the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Standalone,
    #[default]
    MultiNode,
    MultiRegion,
}

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Primary,
    Secondary,
    #[default]
    Worker,
    Observer,
}

impl NodeRole {
    /// Weight of the role in leader priority
    #[must_use]
    pub const fn election_weight(self) -> f64 {
        match self {
            Self::Primary => 100.0,
            Self::Secondary => 80.0,
            Self::Worker => 60.0,
            Self::Observer => 40.0,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Worker => "worker",
            Self::Observer => "observer",
        }
    }
}

/// Load balancing algorithm used for request routing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    IpHash,
    LeastResponseTime,
}

/// Consensus backend placeholder.
///
/// Only the in-memory reference model exists; the variant is carried so that
/// a replicated store can be selected later without a config format change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusAlgorithm {
    #[default]
    Raft,
    Paxos,
    Pbft,
}

/// The coordinator's own node, added to the cluster on start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalNodeConfig {
    pub address: String,
    pub port: u16,
    pub region: String,
    pub zone: String,
    pub role: NodeRole,
    pub capabilities: Vec<String>,
}

impl Default for LocalNodeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 7400,
            region: "default".to_string(),
            zone: "default-a".to_string(),
            role: NodeRole::Primary,
            capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalingConfig {
    pub enabled: bool,
    pub min_replicas: usize,
    pub max_replicas: usize,
    /// CPU or memory utilization (percent) above which a node is added
    pub scale_up_threshold: f64,
    /// CPU and memory utilization (percent) below which a node is removed
    pub scale_down_threshold: f64,
    pub cooldown_secs: u64,
    pub evaluation_interval_secs: u64,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_replicas: 1,
            max_replicas: 10,
            scale_up_threshold: 80.0,
            scale_down_threshold: 30.0,
            cooldown_secs: 300,
            evaluation_interval_secs: 60,
        }
    }
}

impl AutoScalingConfig {
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub const fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub strategy: LoadBalancingStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    /// Run failover without operator action when the leader fails
    pub automatic: bool,
    /// Consecutive unhealthy cycles before a node is marked failed
    pub failure_threshold: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            automatic: true,
            failure_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub algorithm: ConsensusAlgorithm,
    pub quorum_size: usize,
    pub election_timeout_ms: u64,
    /// Period of the consensus maintenance tick
    pub heartbeat_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            algorithm: ConsensusAlgorithm::Raft,
            quorum_size: 1,
            election_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
        }
    }
}

impl ConsensusConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub tls_enabled: bool,
    pub auth_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub health_check_interval_secs: u64,
    /// Number of cluster events retained in memory
    pub event_log_capacity: usize,
    pub metrics_enabled: bool,
    /// How long `stop()` waits for background tasks before aborting them
    pub stop_grace_period_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 10,
            event_log_capacity: 1000,
            metrics_enabled: true,
            stop_grace_period_ms: 5000,
        }
    }
}

impl MonitoringConfig {
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    #[must_use]
    pub const fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}

/// Cluster configuration.
///
/// Treated as immutable once a cluster manager has been built from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfiguration {
    pub name: String,
    pub topology: Topology,
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub local_node: LocalNodeConfig,
    pub auto_scaling: AutoScalingConfig,
    pub load_balancing: LoadBalancingConfig,
    pub failover: FailoverConfig,
    pub consensus: ConsensusConfig,
    pub security: SecurityConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self {
            name: "meridian".to_string(),
            topology: Topology::MultiNode,
            min_nodes: 1,
            max_nodes: 10,
            local_node: LocalNodeConfig::default(),
            auto_scaling: AutoScalingConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
            failover: FailoverConfig::default(),
            consensus: ConsensusConfig::default(),
            security: SecurityConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl ClusterConfiguration {
    /// Check the structural invariants of the configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_nodes > self.max_nodes {
            return Err(Error::Invalid(format!(
                "min_nodes ({}) must not exceed max_nodes ({})",
                self.min_nodes, self.max_nodes
            )));
        }
        if self.consensus.quorum_size > self.max_nodes {
            return Err(Error::Invalid(format!(
                "consensus.quorum_size ({}) must not exceed max_nodes ({})",
                self.consensus.quorum_size, self.max_nodes
            )));
        }

        let scaling = &self.auto_scaling;
        if scaling.min_replicas > scaling.max_replicas {
            return Err(Error::Invalid(format!(
                "auto_scaling.min_replicas ({}) must not exceed max_replicas ({})",
                scaling.min_replicas, scaling.max_replicas
            )));
        }
        for (name, value) in [
            ("scale_up_threshold", scaling.scale_up_threshold),
            ("scale_down_threshold", scaling.scale_down_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(Error::Invalid(format!(
                    "auto_scaling.{name} must be within 0..=100, got {value}"
                )));
            }
        }
        if scaling.scale_down_threshold >= scaling.scale_up_threshold {
            return Err(Error::Invalid(
                "auto_scaling.scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }
        if scaling.enabled
            && (scaling.min_replicas < self.min_nodes || scaling.max_replicas > self.max_nodes)
        {
            return Err(Error::Invalid(format!(
                "auto_scaling replicas [{}, {}] must lie within nodes [{}, {}]",
                scaling.min_replicas, scaling.max_replicas, self.min_nodes, self.max_nodes
            )));
        }
        if scaling.enabled && scaling.evaluation_interval_secs == 0 {
            return Err(Error::Invalid(
                "auto_scaling.evaluation_interval_secs must be non-zero".to_string(),
            ));
        }

        if self.failover.failure_threshold == 0 {
            return Err(Error::Invalid(
                "failover.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.consensus.heartbeat_interval_ms == 0 {
            return Err(Error::Invalid(
                "consensus.heartbeat_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.monitoring.health_check_interval_secs == 0 {
            return Err(Error::Invalid(
                "monitoring.health_check_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.monitoring.event_log_capacity == 0 {
            return Err(Error::Invalid(
                "monitoring.event_log_capacity must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub cleanup_interval_secs: u64,
    pub default_ttl_secs: u64,
    pub health_check_interval_secs: u64,
    pub default_lock_ttl_secs: u64,
    pub default_permit_ttl_secs: u64,
    pub event_channel_capacity: usize,
    pub stop_grace_period_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 30,
            default_ttl_secs: 30,
            health_check_interval_secs: 10,
            default_lock_ttl_secs: 30,
            default_permit_ttl_secs: 30,
            event_channel_capacity: 256,
            stop_grace_period_ms: 5000,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cleanup_interval_secs == 0 || self.health_check_interval_secs == 0 {
            return Err(Error::Invalid(
                "discovery intervals must be non-zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Invalid(
                "discovery.event_channel_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    #[must_use]
    pub const fn default_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.default_lock_ttl_secs)
    }

    #[must_use]
    pub const fn default_permit_ttl(&self) -> Duration {
        Duration::from_secs(self.default_permit_ttl_secs)
    }

    #[must_use]
    pub const fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (MERIDIAN_LOGGING_LEVEL, etc.)
        builder = builder.add_source(
            Environment::with_prefix("MERIDIAN")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Load and validate in one step
    pub fn load_validated(config_file: Option<&str>) -> Result<Self> {
        let config = Self::load(config_file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.discovery.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.failover.failure_threshold, 5);
        assert_eq!(config.cluster.monitoring.event_log_capacity, 1000);
        assert_eq!(config.discovery.default_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_min_nodes_above_max_rejected() {
        let config = ClusterConfiguration {
            min_nodes: 6,
            max_nodes: 5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_nodes"));
    }

    #[test]
    fn test_quorum_above_max_nodes_rejected() {
        let mut config = ClusterConfiguration {
            max_nodes: 3,
            ..Default::default()
        };
        config.consensus.quorum_size = 4;
        assert!(config.validate().is_err());

        config.consensus.quorum_size = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scaling_thresholds_must_be_ordered() {
        let mut config = ClusterConfiguration::default();
        config.auto_scaling.scale_down_threshold = 90.0;
        assert!(config.validate().is_err());

        config.auto_scaling.scale_down_threshold = 20.0;
        config.auto_scaling.scale_up_threshold = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_scaling_replicas_within_node_bounds() {
        let mut config = ClusterConfiguration {
            min_nodes: 2,
            max_nodes: 5,
            ..Default::default()
        };
        // Bounds only matter once auto-scaling is on
        assert!(config.validate().is_ok());

        config.auto_scaling.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must lie within nodes [2, 5]"));

        config.auto_scaling.min_replicas = 2;
        config.auto_scaling.max_replicas = 5;
        assert!(config.validate().is_ok());

        config.auto_scaling.max_replicas = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_weights() {
        assert!(NodeRole::Primary.election_weight() > NodeRole::Secondary.election_weight());
        assert!(NodeRole::Secondary.election_weight() > NodeRole::Worker.election_weight());
        assert!(NodeRole::Worker.election_weight() > NodeRole::Observer.election_weight());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let json = r#"{"cluster":{"min_nodes":2,"max_nodes":5,"load_balancing":{"strategy":"ip_hash"}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.cluster.min_nodes, 2);
        assert_eq!(config.cluster.load_balancing.strategy, LoadBalancingStrategy::IpHash);
        assert_eq!(config.cluster.consensus.quorum_size, 1);
        assert_eq!(config.logging.level, "info");
    }
}
