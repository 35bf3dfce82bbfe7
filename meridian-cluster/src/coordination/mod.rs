//! Coordination primitives hosted by the service registry
//!
//! Every primitive is a plain value mutated under the registry lock. All
//! operations take the current time explicitly and never block; callers
//! that need to wait retry or watch.

pub mod barrier;
pub mod election;
pub mod lock;
pub mod queue;
pub mod semaphore;

pub use barrier::DistributedBarrier;
pub use election::{ElectionCandidate, LeaderElection};
pub use lock::DistributedLock;
pub use queue::{DistributedQueue, QueueItem};
pub use semaphore::{DistributedSemaphore, PermitHolder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A coordination primitive, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationPrimitive {
    Lock(DistributedLock),
    Semaphore(DistributedSemaphore),
    Barrier(DistributedBarrier),
    Queue(DistributedQueue),
    Election(LeaderElection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Lock,
    Semaphore,
    Barrier,
    Queue,
    Election,
}

impl PrimitiveKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Semaphore => "semaphore",
            Self::Barrier => "barrier",
            Self::Queue => "queue",
            Self::Election => "election",
        }
    }
}

impl std::fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoordinationPrimitive {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Lock(p) => &p.id,
            Self::Semaphore(p) => &p.id,
            Self::Barrier(p) => &p.id,
            Self::Queue(p) => &p.id,
            Self::Election(p) => &p.id,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PrimitiveKind {
        match self {
            Self::Lock(_) => PrimitiveKind::Lock,
            Self::Semaphore(_) => PrimitiveKind::Semaphore,
            Self::Barrier(_) => PrimitiveKind::Barrier,
            Self::Queue(_) => PrimitiveKind::Queue,
            Self::Election(_) => PrimitiveKind::Election,
        }
    }
}

/// `start + ttl`, saturating instead of overflowing
pub(crate) fn deadline(start: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| start.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
