use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::deadline;

/// Mutually exclusive lock with an expiring owner.
///
/// Not re-entrant: the owner itself cannot acquire again until the lock is
/// released or has expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLock {
    pub id: String,
    pub acquired: bool,
    pub acquired_by: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl DistributedLock {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            acquired: false,
            acquired_by: None,
            acquired_at: None,
            expires_at: None,
        }
    }

    /// Owner holding the lock at `now`, if any
    #[must_use]
    pub fn holder(&self, now: DateTime<Utc>) -> Option<&str> {
        if !self.acquired {
            return None;
        }
        match self.expires_at {
            Some(expires_at) if now > expires_at => None,
            _ => self.acquired_by.as_deref(),
        }
    }

    #[must_use]
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.holder(now).is_some()
    }

    pub fn acquire(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.is_held(now) {
            return false;
        }
        self.acquired = true;
        self.acquired_by = Some(owner.to_string());
        self.acquired_at = Some(now);
        self.expires_at = Some(deadline(now, ttl));
        true
    }

    /// Release by the current holder; anyone else gets `false`
    pub fn release(&mut self, owner: &str, now: DateTime<Utc>) -> bool {
        if self.holder(now) != Some(owner) {
            return false;
        }
        self.clear();
        true
    }

    /// Push the expiry to `now + ttl`; only the unexpired holder may extend
    pub fn extend(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.holder(now) != Some(owner) {
            return false;
        }
        self.expires_at = Some(deadline(now, ttl));
        true
    }

    /// Drop an expired ownership; returns true if one was dropped
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.acquired && !self.is_held(now) {
            self.clear();
            return true;
        }
        false
    }

    fn clear(&mut self) {
        self.acquired = false;
        self.acquired_by = None;
        self.acquired_at = None;
        self.expires_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_mutual_exclusion() {
        let now = Utc::now();
        let mut lock = DistributedLock::new("jobs");

        assert!(lock.acquire("a", TTL, now));
        assert!(!lock.acquire("b", TTL, now));
        assert_eq!(lock.holder(now), Some("a"));
    }

    #[test]
    fn test_not_reentrant() {
        let now = Utc::now();
        let mut lock = DistributedLock::new("jobs");
        assert!(lock.acquire("a", TTL, now));
        assert!(!lock.acquire("a", TTL, now));
    }

    #[test]
    fn test_release_only_by_holder() {
        let now = Utc::now();
        let mut lock = DistributedLock::new("jobs");
        assert!(lock.acquire("a", TTL, now));

        assert!(!lock.release("b", now));
        assert!(lock.is_held(now));

        assert!(lock.release("a", now));
        assert!(!lock.acquired);
        assert!(lock.acquired_by.is_none());
        assert!(lock.acquire("b", TTL, now));
    }

    #[test]
    fn test_expired_lock_is_free() {
        let now = Utc::now();
        let mut lock = DistributedLock::new("jobs");
        assert!(lock.acquire("a", Duration::from_secs(1), now));

        // Still held exactly at the expiry instant
        let at_expiry = now + chrono::Duration::seconds(1);
        assert!(!lock.acquire("b", TTL, at_expiry));

        let later = now + chrono::Duration::milliseconds(1001);
        assert!(!lock.is_held(later));
        assert!(!lock.release("a", later));
        assert!(lock.acquire("b", TTL, later));
        assert_eq!(lock.holder(later), Some("b"));
    }

    #[test]
    fn test_extend() {
        let now = Utc::now();
        let mut lock = DistributedLock::new("jobs");
        assert!(lock.acquire("a", Duration::from_secs(1), now));

        assert!(!lock.extend("b", TTL, now));
        assert!(lock.extend("a", Duration::from_secs(10), now));

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(lock.holder(later), Some("a"));

        let expired = now + chrono::Duration::seconds(11);
        assert!(!lock.extend("a", TTL, expired));
    }

    #[test]
    fn test_expire_sweep() {
        let now = Utc::now();
        let mut lock = DistributedLock::new("jobs");
        assert!(!lock.expire(now));

        assert!(lock.acquire("a", Duration::from_secs(1), now));
        assert!(!lock.expire(now));
        assert!(lock.expire(now + chrono::Duration::seconds(2)));
        assert!(!lock.acquired);
    }
}
