//! Service registry with TTL heartbeats, health checks and watchers

pub mod events;
pub mod instance;
pub mod manager;
pub mod watch;

pub use events::{DiscoveryEvent, ServiceChange};
pub use instance::{
    Protocol, ServiceHealth, ServiceHealthStatus, ServiceInstance, ServiceQuery, ServiceRegistration,
};
pub use manager::{CleanupReport, ServiceDiscoveryManager};
pub use watch::{WatchCallback, WatchHandle};
