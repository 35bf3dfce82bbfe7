//! Keyed periodic background tasks with cooperative cancellation

use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct Timer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Set of periodic tasks, one per key.
///
/// Every task runs under a child of the set's root token. `shutdown`
/// cancels the root and waits for each task; callbacks still running after
/// the grace period are aborted, so no callback outlives `shutdown`.
pub struct TimerSet {
    root: Mutex<CancellationToken>,
    timers: DashMap<String, Timer>,
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Mutex::new(CancellationToken::new()),
            timers: DashMap::new(),
        }
    }

    /// Install a fresh root token (after a previous shutdown)
    pub fn reset(&self) {
        let mut root = self.root.lock();
        if root.is_cancelled() {
            *root = CancellationToken::new();
        }
    }

    /// Run `tick` every `period` until cancelled.
    ///
    /// The first tick fires after one full period. A task already running
    /// under `key` is cancelled and replaced.
    pub fn spawn<F, Fut>(&self, key: impl Into<String>, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let token = self.root.lock().child_token();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer.reset_at(Instant::now() + period);

            loop {
                tokio::select! {
                    biased;
                    () = task_token.cancelled() => break,
                    _ = timer.tick() => {
                        tokio::select! {
                            biased;
                            () = task_token.cancelled() => break,
                            () = tick() => {}
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.timers.insert(key, Timer { token, handle }) {
            previous.token.cancel();
        }
    }

    /// Cancel the task registered under `key`
    pub fn cancel(&self, key: &str) -> bool {
        match self.timers.remove(key) {
            Some((_, timer)) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.timers.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(&self, grace: Duration) {
        self.root.lock().cancel();

        let keys: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        let deadline = Instant::now() + grace;

        for key in keys {
            let Some((_, timer)) = self.timers.remove(&key) else {
                continue;
            };
            let abort = timer.handle.abort_handle();
            if tokio::time::timeout_at(deadline, timer.handle).await.is_err() {
                tracing::warn!(task = %key, "Background task did not stop within grace period, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.root.get_mut().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_tick_and_cancel() {
        let timers = TimerSet::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        timers.spawn("a", Duration::from_millis(100), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert!(timers.cancel("a"));
        assert!(!timers.cancel("a"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let timers = TimerSet::new();
        let count = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            let counter = count.clone();
            timers.spawn(key, Duration::from_millis(50), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(timers.len(), 3);

        tokio::time::sleep(Duration::from_millis(120)).await;
        timers.shutdown(Duration::from_secs(1)).await;
        assert!(timers.is_empty());

        let after = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_long_callback() {
        let timers = TimerSet::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        timers.spawn("slow", Duration::from_millis(10), move || {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        timers.shutdown(Duration::from_secs(1)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_after_shutdown() {
        let timers = TimerSet::new();
        timers.shutdown(Duration::from_millis(10)).await;
        timers.reset();

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        timers.spawn("a", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
