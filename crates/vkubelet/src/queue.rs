//! A rate-limited, deduplicating work queue.
//!
//! Keys are held by at most one consumer at a time. Adding a key that is
//! already queued is absorbed, and adding a key that is being processed is
//! remembered once and re-queued when the consumer calls [`WorkQueue::done`].
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::trace;

use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};

/// Trait alias for types usable as queue keys.
pub trait QueueKey: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

struct State<K> {
    queue: VecDeque<K>,
    // Every key that needs processing, whether queued or waiting for its
    // in-flight run to finish.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, ExponentialBackoffStrategy>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ExponentialBackoffStrategy,
}

/// Work queue keyed by `K`. Cloning yields another handle to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: QueueKey> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new(ExponentialBackoffStrategy::default())
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Creates a queue whose per-key retry delays follow `backoff`.
    pub fn new(backoff: ExponentialBackoffStrategy) -> Self {
        WorkQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Marks `key` as needing processing.
    pub async fn add(&self, key: K) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(?key, "key in flight, deferring requeue");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Waits for the next key and marks it in flight.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Created before inspecting the state so an add that lands in
            // between still wakes us.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases the in-flight mark on `key`, re-queueing it if it was added
    /// while being processed.
    pub async fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Re-adds `key` after its next exponential backoff delay.
    pub async fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down {
                return;
            }
            let backoff = &self.inner.backoff;
            state
                .failures
                .entry(key.clone())
                .or_insert_with(|| backoff.clone())
                .next_duration()
        };
        self.add_after(key, delay);
    }

    /// Re-adds `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Clears the backoff history of `key`.
    pub async fn forget(&self, key: &K) {
        self.inner.state.lock().await.failures.remove(key);
    }

    /// Number of rate-limited requeues since `key` was last forgotten.
    pub async fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .await
            .failures
            .get(key)
            .map(|b| b.attempts())
            .unwrap_or(0)
    }

    /// Number of keys waiting to be handed out.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Whether no keys are waiting to be handed out.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stops accepting keys. Consumers drain what is queued, then `get`
    /// returns `None`.
    pub async fn shut_down(&self) {
        self.inner.state.lock().await.shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] was called.
    pub async fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().await.shutting_down
    }
}
