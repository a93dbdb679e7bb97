//! Keyed work queue and the worker pool draining it.
//!
//! A key is never processed by two workers at once: re-adding a key while it
//! is in flight marks it dirty and it is queued again when the pass ends.
//! Pending keys are deduplicated and served in FIFO order. Delayed adds
//! coalesce per key: only the earliest pending timer survives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kiln_core::{Managed, ObjectKey};
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    in_flight: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    failures: FxHashMap<ObjectKey, u32>,
    scheduled: FxHashMap<ObjectKey, Instant>,
    shutdown: bool,
}

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self { name, state: Mutex::new(QueueState::default()), notify: Notify::new() })
    }

    pub fn name(&self) -> &'static str { self.name }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: ObjectKey) {
        let mut s = self.lock();
        if s.shutdown || s.queued.contains(&key) {
            return;
        }
        if s.in_flight.contains(&key) {
            s.dirty.insert(key);
            return;
        }
        s.queued.insert(key.clone());
        s.pending.push_back(key);
        gauge!("queue_depth", s.pending.len() as f64, "queue" => self.name);
        drop(s);
        self.notify.notify_one();
    }

    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let at = Instant::now() + delay;
        {
            let mut s = self.lock();
            if s.shutdown {
                return;
            }
            if s.scheduled.get(&key).is_some_and(|&earlier| earlier <= at) {
                return;
            }
            s.scheduled.insert(key.clone(), at);
        }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            {
                let mut s = q.lock();
                // superseded by an earlier timer for the same key
                if s.scheduled.get(&key) != Some(&at) {
                    return;
                }
                s.scheduled.remove(&key);
            }
            q.add(key);
        });
    }

    /// Number of keys waiting on a delayed add.
    pub fn scheduled(&self) -> usize { self.lock().scheduled.len() }

    /// Next key to process; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = self.lock();
                if s.shutdown {
                    return None;
                }
                if let Some(key) = s.pending.pop_front() {
                    s.queued.remove(&key);
                    s.in_flight.insert(key.clone());
                    gauge!("queue_depth", s.pending.len() as f64, "queue" => self.name);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark the pass over `key` finished.
    pub fn done(&self, key: &ObjectKey) {
        let mut s = self.lock();
        s.in_flight.remove(key);
        if s.dirty.remove(key) && !s.shutdown {
            s.queued.insert(key.clone());
            s.pending.push_back(key.clone());
            drop(s);
            self.notify.notify_one();
        }
    }

    /// Delay before retrying a failed key; grows with consecutive failures.
    pub fn backoff(&self, key: &ObjectKey, base: Duration, max: Duration) -> Duration {
        let mut s = self.lock();
        let n = s.failures.entry(key.clone()).or_insert(0);
        let factor = 1u32.checked_shl((*n).min(31)).unwrap_or(u32::MAX);
        *n = n.saturating_add(1);
        base.checked_mul(factor).unwrap_or(max).min(max)
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &ObjectKey) { self.lock().failures.remove(key); }

    pub fn failures(&self, key: &ObjectKey) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    pub fn len(&self) -> usize { self.lock().pending.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}

/// Spawn `workers` tasks reconciling keys from `queue` until `cancel` fires.
pub fn spawn_workers<K: Managed>(
    dispatcher: Arc<Dispatcher<K>>,
    queue: Arc<WorkQueue>,
    workers: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|id| {
            let dispatcher = Arc::clone(&dispatcher);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                debug!(queue = queue.name(), worker = id, "worker started");
                loop {
                    let key = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = queue.get() => match next {
                            Some(key) => key,
                            None => break,
                        },
                    };
                    let config = &dispatcher.runtime().config;
                    match dispatcher.reconcile(&key).await {
                        Ok(outcome) => {
                            queue.forget(&key);
                            if let Some(after) = outcome.requeue_after {
                                queue.add_after(key.clone(), after);
                            }
                        }
                        Err(e) => {
                            let delay = queue.backoff(&key, config.backoff_base, config.backoff_max);
                            warn!(queue = queue.name(), key = %key, error = %e, retry_in = ?delay, "reconcile failed");
                            queue.add_after(key.clone(), delay);
                        }
                    }
                    queue.done(&key);
                }
                info!(queue = queue.name(), worker = id, "worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: &str) -> ObjectKey { ObjectKey::new("ns", n) }

    #[tokio::test]
    async fn pending_keys_are_deduplicated_fifo() {
        let q = WorkQueue::new("t");
        q.add(key("a"));
        q.add(key("b"));
        q.add(key("a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, Some(key("b")));
    }

    #[tokio::test]
    async fn in_flight_key_is_requeued_once_done() {
        let q = WorkQueue::new("t");
        q.add(key("a"));
        let a = q.get().await.unwrap();
        q.add(key("a"));
        q.add(key("a"));
        assert!(q.is_empty());
        q.done(&a);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key("a")));
        q.done(&a);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let q = WorkQueue::new("t");
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add(key("a"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn delayed_adds_coalesce_per_key() {
        let q = WorkQueue::new("t");
        q.add_after(key("a"), Duration::from_millis(40));
        q.add_after(key("a"), Duration::from_millis(80));
        q.add_after(key("a"), Duration::from_millis(120));
        q.add_after(key("b"), Duration::from_millis(40));
        assert_eq!(q.scheduled(), 2);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(q.len(), 2);
        assert_eq!(q.scheduled(), 0);
        let a = q.get().await.unwrap();
        q.done(&a);
        let b = q.get().await.unwrap();
        q.done(&b);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn earlier_delay_replaces_later_timer() {
        let q = WorkQueue::new("t");
        q.add_after(key("a"), Duration::from_secs(30));
        q.add_after(key("a"), Duration::from_millis(10));
        assert_eq!(q.scheduled(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.scheduled(), 0);
    }

    #[tokio::test]
    async fn waiting_key_keeps_a_single_requeue_chain() {
        let q = WorkQueue::new("t");
        let requeue = Duration::from_millis(50);
        let passes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let worker = {
            let q = Arc::clone(&q);
            let passes = Arc::clone(&passes);
            tokio::spawn(async move {
                while let Some(k) = q.get().await {
                    passes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    q.add_after(k.clone(), requeue);
                    q.done(&k);
                }
            })
        };
        for _ in 0..5 {
            q.add(key("a"));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        q.shutdown();
        worker.await.unwrap();
        // one chain over ~550ms at 50ms plus the five direct adds
        let n = passes.load(std::sync::atomic::Ordering::SeqCst);
        assert!(n <= 18, "requeue chains multiplied: {n} passes");
    }

    #[test]
    fn backoff_grows_and_resets() {
        let q = WorkQueue::new("t");
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        assert_eq!(q.backoff(&key("a"), base, max), Duration::from_millis(100));
        assert_eq!(q.backoff(&key("a"), base, max), Duration::from_millis(200));
        assert_eq!(q.backoff(&key("a"), base, max), Duration::from_millis(400));
        assert_eq!(q.backoff(&key("a"), base, max), max);
        q.forget(&key("a"));
        assert_eq!(q.failures(&key("a")), 0);
    }
}
