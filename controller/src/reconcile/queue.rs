//! Per-key deduplicating work queue with delayed and rate-limited adds

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::utils::{calc_exp_backoff, CooldownOptions};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, queued or parked behind an in-flight run
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    /// Earliest pending delayed add per key; one timer task per entry
    delayed: HashMap<String, Instant>,
    shutting_down: bool,
}

/// Work queue handing each key to at most one worker at a time.
///
/// A key added while queued is coalesced; a key added while being
/// processed is parked and re-queued by [`WorkQueue::done`].
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: CooldownOptions,
}

impl WorkQueue {
    pub fn new(backoff: CooldownOptions) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        trace!(key = %key, "Queued");
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed.
    ///
    /// A key keeps at most one timer: a later deadline than the pending one
    /// is dropped, an earlier one replaces it.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if state.delayed.get(key).is_some_and(|pending| *pending <= deadline) {
                return;
            }
            state.delayed.insert(key.to_string(), deadline);
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut state = queue.lock();
                if state.delayed.get(&key) != Some(&deadline) {
                    // Superseded by an earlier timer
                    return;
                }
                state.delayed.remove(&key);
            }
            queue.add(&key);
        });
    }

    /// Add `key` after a per-key exponential backoff; returns the delay used
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let attempt = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            *failures - 1
        };
        let delay = calc_exp_backoff(&self.backoff, attempt);
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff for `key`
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key; `None` once the queue is shutting down
    pub async fn get(&self) -> Option<String> {
        loop {
            // Registered before inspecting state so a concurrent add or shutdown is not missed
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; re-queues it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(CooldownOptions::default())
    }
}
