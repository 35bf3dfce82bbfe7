//! Name-scoped watchers for service changes

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::events::ServiceChange;

pub type WatchCallback = Arc<dyn Fn(&ServiceChange) + Send + Sync>;

struct Watcher {
    id: u64,
    service: String,
    callback: WatchCallback,
}

/// Observer list with isolated dispatch
#[derive(Default)]
pub(crate) struct Watchers {
    next_id: AtomicU64,
    entries: Mutex<Vec<Watcher>>,
}

impl Watchers {
    pub(crate) fn add(&self, service: &str, callback: WatchCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Watcher {
            id,
            service: service.to_string(),
            callback,
        });
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|w| w.id != id);
        entries.len() != before
    }

    pub(crate) fn count(&self, service: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|w| w.service == service)
            .count()
    }

    /// Deliver a change to the watchers of `service`.
    ///
    /// Must be called without holding the registry lock. A panicking
    /// callback is logged and skipped; the others still run.
    pub(crate) fn notify(&self, service: &str, change: &ServiceChange) {
        let callbacks: Vec<WatchCallback> = self
            .entries
            .lock()
            .iter()
            .filter(|w| w.service == service)
            .map(|w| w.callback.clone())
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
                tracing::warn!(
                    service = %service,
                    change = change.as_str(),
                    "Service watcher panicked"
                );
            }
        }
    }
}

/// Subscription returned by `watch_service`.
///
/// Dropping the handle keeps the watcher registered; call `unwatch` to
/// stop receiving changes.
pub struct WatchHandle {
    id: u64,
    service: String,
    watchers: Weak<Watchers>,
    active: AtomicBool,
}

impl WatchHandle {
    pub(crate) fn new(id: u64, service: &str, watchers: &Arc<Watchers>) -> Self {
        Self {
            id,
            service: service.to_string(),
            watchers: Arc::downgrade(watchers),
            active: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop the subscription; later calls do nothing
    pub fn unwatch(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(watchers) = self.watchers.upgrade() {
                watchers.remove(self.id);
            }
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("active", &self.is_active())
            .finish()
    }
}
