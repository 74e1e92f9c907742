use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Exponential per-key retry delay: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let secs = self.base.as_secs_f64() * 2f64.powi(failures.min(64) as i32);

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }

        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Delayed {
    ready_at: Instant,
    seq: u64,
    key: String,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be handed out, including those re-added while in flight.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
    seq: u64,
}

impl QueueState {
    /// Returns true if the key was pushed to the ready queue.
    fn insert(&mut self, key: String) -> bool {
        if !self.dirty.insert(key.clone()) {
            return false;
        }

        if self.processing.contains(&key) {
            return false;
        }

        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(next)) = self.delayed.peek() {
            if next.ready_at > now {
                break;
            }

            if let Some(Reverse(delayed)) = self.delayed.pop() {
                self.insert(delayed.key);
            }
        }
    }
}

/// Rate limited work queue of `namespace/name` keys.
///
/// A key is never handed out twice at the same time: a key added while it is
/// being processed is handed out again once [`WorkQueue::done`] is called for it.
/// Pending duplicates collapse into one delivery.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: Backoff,
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: impl Into<String>) {
        let mut state = self.lock();

        if state.shutting_down {
            return;
        }

        if state.insert(key.into()) {
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }

        let mut state = self.lock();

        if state.shutting_down {
            return;
        }

        state.seq += 1;
        let delayed = Delayed {
            ready_at: Instant::now() + delay,
            seq: state.seq,
            key: key.into(),
        };
        state.delayed.push(Reverse(delayed));
        drop(state);

        self.notify.notify_one();
    }

    /// Schedules the key after its current backoff and counts one more failure.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_default();
            let delay = self.backoff.delay(*failures);
            *failures += 1;
            delay
        };

        self.add_after(key, delay);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or_default()
    }

    /// Clears the retry history of the key.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();

            let deadline = {
                let mut state = self.lock();
                state.promote_due(Instant::now());

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }

                if state.shutting_down {
                    return None;
                }

                state.delayed.peek().map(|Reverse(next)| next.ready_at)
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Marks the key as no longer in flight.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);

        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stops accepting keys. Queued keys are still handed out, delayed ones are dropped.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.delayed.clear();
        drop(state);

        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
