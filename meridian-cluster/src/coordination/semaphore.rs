use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::deadline;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermitHolder {
    pub id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl PermitHolder {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > deadline(self.acquired_at, self.ttl)
    }
}

/// Counting semaphore whose permits expire after their holder's TTL.
///
/// Every operation sweeps expired holders first, so
/// `available + holders.len() == capacity` holds after each call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSemaphore {
    pub id: String,
    pub capacity: u32,
    pub available: u32,
    pub holders: Vec<PermitHolder>,
}

impl DistributedSemaphore {
    #[must_use]
    pub fn new(id: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            capacity,
            available: capacity,
            holders: Vec::new(),
        }
    }

    /// Remove expired holders, returning how many were dropped
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.holders.len();
        self.holders.retain(|h| !h.is_expired(now));
        self.sync_available();
        before - self.holders.len()
    }

    /// Grant a permit to `holder`; a holder may own at most one permit
    pub fn acquire(&mut self, holder: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.sweep(now);
        if self.available == 0 || self.is_holder(holder) {
            return false;
        }
        self.holders.push(PermitHolder {
            id: holder.to_string(),
            acquired_at: now,
            ttl,
        });
        self.sync_available();
        true
    }

    pub fn release(&mut self, holder: &str, now: DateTime<Utc>) -> bool {
        self.sweep(now);
        let Some(index) = self.holders.iter().position(|h| h.id == holder) else {
            return false;
        };
        self.holders.remove(index);
        self.sync_available();
        true
    }

    #[must_use]
    pub fn is_holder(&self, holder: &str) -> bool {
        self.holders.iter().any(|h| h.id == holder)
    }

    fn sync_available(&mut self) {
        let held = u32::try_from(self.holders.len()).unwrap_or(u32::MAX);
        self.available = self.capacity.saturating_sub(held);
    }
}
