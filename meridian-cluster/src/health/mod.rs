//! Health check engine for nodes and service instances

pub mod check;
pub mod probe;

pub use check::{score, CheckKind, CheckStatus, CheckType, HealthCheck, HealthStatus};
pub use probe::{cycle_interval, HealthProbe, ProbeOutcome, ProbeRegistry, ProbeTarget, TtlProbe};
