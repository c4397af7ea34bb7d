//! Deduplicating, rate-limited delay queue of work keys.
//!
//! A key is *pending* from the moment it is added until a worker takes it,
//! and there is never more than one pending entry per key. A key a worker
//! holds is never handed to a second worker: adding it again while it is
//! being processed parks it until [`WorkQueue::done`], which then makes it
//! eligible immediately.

pub mod backoff;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::model::WorkKey;
use crate::telemetry::metrics;

pub use backoff::ItemBackoff;

/// Stand-in for "never" when a delay does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + delay`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// What happened to a key handed to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Newly eligible for a worker.
    Queued,
    /// Already pending; folded into the existing entry.
    Merged,
    /// Being processed right now; eligible again once the worker is done.
    Deferred,
    /// Parked until its delay elapses.
    Delayed,
    /// The queue is shutting down and ignored the key.
    ShutDown,
}

impl Enqueued {
    fn as_str(self) -> &'static str {
        match self {
            Enqueued::Queued => "queued",
            Enqueued::Merged => "merged",
            Enqueued::Deferred => "deferred",
            Enqueued::Delayed => "delayed",
            Enqueued::ShutDown => "rejected",
        }
    }
}

pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ItemBackoff,
}

#[derive(Default)]
struct QueueState {
    /// Keys eligible for a worker, in first-seen order.
    queue: VecDeque<WorkKey>,
    /// Pending keys: everything in `queue` plus keys re-added mid-processing.
    dirty: HashSet<WorkKey>,
    processing: HashSet<WorkKey>,
    /// Delayed keys ordered by (ready_at, insertion seq).
    waiting: BTreeMap<(Instant, u64), WorkKey>,
    waiting_index: HashMap<WorkKey, (Instant, u64)>,
    seq: u64,
    shutting_down: bool,
}

impl QueueState {
    fn insert(&mut self, key: WorkKey) -> Enqueued {
        // An immediate add supersedes any delayed entry for the same key.
        if let Some(slot) = self.waiting_index.remove(&key) {
            self.waiting.remove(&slot);
        }
        if self.dirty.contains(&key) {
            return Enqueued::Merged;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return Enqueued::Deferred;
        }
        self.queue.push_back(key);
        Enqueued::Queued
    }

    fn schedule(&mut self, key: WorkKey, ready_at: Instant) -> Enqueued {
        if self.dirty.contains(&key) {
            return Enqueued::Merged;
        }
        if let Some(&(at, seq)) = self.waiting_index.get(&key) {
            if at <= ready_at {
                return Enqueued::Merged;
            }
            self.waiting.remove(&(at, seq));
        }
        self.seq += 1;
        let slot = (ready_at, self.seq);
        self.waiting.insert(slot, key.clone());
        self.waiting_index.insert(key, slot);
        Enqueued::Delayed
    }

    fn promote(&mut self, now: Instant) {
        while let Some(entry) = self.waiting.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.waiting_index.remove(&key);
            self.insert(key);
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.keys().next().map(|(at, _)| *at)
    }
}

impl WorkQueue {
    /// A queue with the default 5s..5min per-key backoff.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, ItemBackoff::default())
    }

    pub fn with_backoff(name: impl Into<String>, backoff: ItemBackoff) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, outcome: Enqueued) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", outcome.as_str()),
            ],
        );
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: WorkKey) -> Enqueued {
        let outcome = {
            let mut state = self.lock();
            if state.shutting_down {
                Enqueued::ShutDown
            } else {
                state.insert(key.clone())
            }
        };
        if outcome == Enqueued::Queued {
            self.notify.notify_waiters();
        }
        debug!(queue = %self.name, %key, outcome = outcome.as_str(), "add");
        self.record(outcome);
        outcome
    }

    /// Add `key` once `delay` has elapsed. An earlier schedule for the same
    /// key, or a pending entry, wins.
    pub fn add_after(&self, key: WorkKey, delay: Duration) -> Enqueued {
        if delay.is_zero() {
            return self.add(key);
        }
        let outcome = {
            let mut state = self.lock();
            if state.shutting_down {
                Enqueued::ShutDown
            } else {
                state.schedule(key.clone(), deadline_after(delay))
            }
        };
        if outcome == Enqueued::Delayed {
            // Sleeping workers recompute their wake-up time.
            self.notify.notify_waiters();
        }
        debug!(queue = %self.name, %key, delay_ms = delay.as_millis() as u64, outcome = outcome.as_str(), "add_after");
        self.record(outcome);
        outcome
    }

    /// Re-add `key` after its next backoff delay. Returns the delay used.
    pub fn add_rate_limited(&self, key: WorkKey) -> Duration {
        let delay = self.backoff.when(&key);
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &WorkKey) {
        self.backoff.forget(key);
    }

    pub fn num_requeues(&self, key: &WorkKey) -> u32 {
        self.backoff.num_requeues(key)
    }

    /// Wait for the next eligible key and mark it as being processed.
    ///
    /// Returns `None` once the queue is shut down and no eligible keys are
    /// left.
    pub async fn get(&self) -> Option<WorkKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready_at = {
                let mut state = self.lock();
                state.promote(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_ready_at()
            };

            match next_ready_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `key` as no longer being processed. If it was re-added in the
    /// meantime it becomes eligible immediately.
    pub fn done(&self, key: &WorkKey) {
        {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
            }
        }
        self.notify.notify_waiters();
    }

    /// Stop accepting keys. Delayed keys are dropped; eligible keys are
    /// still handed out until none remain.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
            state.waiting_index.clear();
        }
        debug!(queue = %self.name, "shutting down");
        self.notify.notify_waiters();
    }

    /// [`shut_down`](Self::shut_down), then wait for in-flight keys to be
    /// marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys eligible for a worker right now.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys parked behind a delay.
    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_pending(&self, key: &WorkKey) -> bool {
        self.lock().dirty.contains(key)
    }

    pub fn is_processing(&self, key: &WorkKey) -> bool {
        self.lock().processing.contains(key)
    }

    /// True when nothing is eligible, parked, or in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.dirty.is_empty() && state.processing.is_empty() && state.waiting.is_empty()
    }
}
