// # Work Queue
//
// Deduplicated key queue with per-key rate-limited retry, feeding the
// reconciler worker pools.
//
// Invariants:
// - At most one in-flight copy of a key: a key popped by `get` is marked
//   processing; re-adds while processing are deferred until `done`.
// - `done` must be called exactly once per successful `get`.
// - After `shutdown`, `get` drains the remaining keys then reports the
//   queue closed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    requeues: HashMap<String, u32>,
    shutdown: bool,
}

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        Self::with_delays(name, Duration::from_secs(1), Duration::from_secs(300))
    }

    pub fn with_delays(name: &'static str, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Enqueue a key. Duplicate adds while the key is pending or in flight
    /// collapse into a single future invocation.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutdown || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            // Deferred until done() re-queues it.
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue after an exponential per-key backoff.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            let requeues = state.requeues.entry(key.to_string()).or_insert(0);
            let exp = (*requeues).min(16);
            *requeues += 1;
            let delay = self
                .base_delay
                .saturating_mul(2u32.saturating_pow(exp))
                .min(self.max_delay);
            delay
        };

        trace!(queue = self.name, key, ?delay, "requeue with backoff");
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Number of rate-limited requeues since the last `forget`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Reset the backoff state for a key.
    pub fn forget(&self, key: &str) {
        self.state.lock().requeues.remove(key);
    }

    /// Pop the next key, waiting if the queue is empty. Returns `None` once
    /// the queue has been shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.as_mut().await;
        }
    }

    /// Mark a key's in-flight invocation complete. If the key was re-added
    /// while processing, it becomes pending again.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.queue.iter().any(|k| k == key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting adds; wake all waiters so they can drain and exit.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = WorkQueue::new("test");
        queue.add("ns/a");
        queue.add("ns/a");
        queue.add("ns/b");
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_single_in_flight_copy_per_key() {
        let queue = WorkQueue::new("test");
        queue.add("ns/a");
        let key = queue.get().await.unwrap();
        assert_eq!(key, "ns/a");

        // Re-add while processing defers rather than double-queueing.
        queue.add("ns/a");
        assert_eq!(queue.len(), 0);

        queue.done("ns/a");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap(), "ns/a");
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_closes() {
        let queue = WorkQueue::new("test");
        queue.add("ns/a");
        queue.shutdown();
        assert_eq!(queue.get().await.unwrap(), "ns/a");
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn test_adds_ignored_after_shutdown() {
        let queue = WorkQueue::new("test");
        queue.shutdown();
        queue.add("ns/a");
        assert!(queue.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_grows() {
        let queue = Arc::new(WorkQueue::with_delays(
            "test",
            Duration::from_millis(100),
            Duration::from_secs(10),
        ));
        queue.add_rate_limited("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 1);
        queue.add_rate_limited("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 2);

        // First delay 100ms, second 200ms; both land after time advances.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(queue.len(), 1);

        queue.forget("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 0);
    }
}
