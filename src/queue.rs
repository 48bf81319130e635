//! # Hysteresis queue
//!
//! Bounded FIFO of pending [`Task`]s sitting between callers and a forwarder.
//!
//! Acceptance is switched off once the buffer reaches the high watermark and only switched
//! back on when a drain brings it down to the low watermark. Two distinct thresholds keep the
//! queue from flapping around a single fill level under sustained load.
//!
//! Consumers ask for "up to N tasks". If nothing is buffered the request is parked and served,
//! oldest first, by later `put` calls. Deliveries and watermark callbacks always go through
//! [`Scheduler::run_soon`].
use crate::completion::Task;
use crate::error::ConfigError;
use crate::scheduler::Scheduler;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

/// Receives the accept count (high watermark) or the drop count (low watermark).
pub type WatermarkCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Resolves with a non-empty batch once the queue can serve the request. Fails only if the
/// queue itself was dropped.
pub type BatchReceiver = oneshot::Receiver<Vec<Task>>;

struct Waiter {
    maxbatch: usize,
    tx: oneshot::Sender<Vec<Task>>,
}

struct State {
    buffer: VecDeque<Task>,
    waiters: VecDeque<Waiter>,
    active: bool,
    drop_count: usize,
    accept_count: usize,
}

struct Inner {
    low: usize,
    high: usize,
    scheduler: Arc<dyn Scheduler>,
    on_high: Option<WatermarkCallback>,
    on_low: Option<WatermarkCallback>,
    state: Mutex<State>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub waiting: usize,
    pub active: bool,
    pub drop_count: usize,
    pub accept_count: usize,
}

/// Cheap to clone; clones share the same buffer.
#[derive(Clone)]
pub struct HysteresisQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HysteresisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HysteresisQueue")
            .field("low", &self.inner.low)
            .field("high", &self.inner.high)
            .field("stats", &self.stats())
            .finish()
    }
}

impl HysteresisQueue {
    pub fn new(low: usize, high: usize, scheduler: Arc<dyn Scheduler>) -> Result<Self, ConfigError> {
        Self::with_watermarks(low, high, scheduler, None, None)
    }

    pub fn with_watermarks(
        low: usize,
        high: usize,
        scheduler: Arc<dyn Scheduler>,
        on_high: Option<WatermarkCallback>,
        on_low: Option<WatermarkCallback>,
    ) -> Result<Self, ConfigError> {
        if high == 0 || low > high {
            return Err(ConfigError::Invalid(format!(
                "queue watermarks must satisfy low <= high and high > 0 (low={}, high={})",
                low, high
            )));
        }

        Ok(HysteresisQueue {
            inner: Arc::new(Inner {
                low,
                high,
                scheduler,
                on_high,
                on_low,
                state: Mutex::new(State {
                    buffer: VecDeque::new(),
                    waiters: VecDeque::new(),
                    active: true,
                    drop_count: 0,
                    accept_count: 0,
                }),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-updated in a way that
        // matters more than losing the queue, so keep serving.
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offers a task to the queue. Returns `false` if the queue is over its high watermark.
    pub fn put(&self, task: Task) -> bool {
        self.try_put(task).is_ok()
    }

    /// Like [`put`](Self::put), but hands a refused task back so its completion can still be
    /// failed.
    pub fn try_put(&self, task: Task) -> Result<(), Task> {
        let mut state = self.lock();
        if !state.active {
            state.drop_count += 1;
            return Err(task);
        }
        state.accept_count += 1;

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            drop(state);
            self.deliver(waiter.tx, vec![task]);
            return Ok(());
        }

        state.buffer.push_back(task);
        if state.buffer.len() >= self.inner.high {
            state.active = false;
            let accepted = std::mem::take(&mut state.accept_count);
            let len = state.buffer.len();
            drop(state);

            tracing::warn!(len, accepted, "Queue reached high watermark, refusing new tasks");
            if let Some(callback) = self.inner.on_high.clone() {
                self.inner.scheduler.run_soon(Box::new(move || callback(accepted)));
            }
        }
        Ok(())
    }

    /// Asks for up to `maxbatch` tasks. Served right away (on the next loop turn) if anything
    /// is buffered, otherwise parked behind earlier requests.
    pub fn get(&self, maxbatch: usize) -> BatchReceiver {
        let (tx, rx) = oneshot::channel();
        let maxbatch = maxbatch.max(1);
        let mut state = self.lock();

        if state.buffer.is_empty() {
            state.waiters.push_back(Waiter { maxbatch, tx });
            return rx;
        }

        let (batch, reopened) = self.drain_front(&mut state, maxbatch);
        drop(state);

        self.deliver(tx, batch);
        self.announce_reopened(reopened);
        rx
    }

    /// Puts a previously drained batch back at the front of the queue, order preserved.
    /// Tasks that come back this way were already accepted, so the watermark gate does not
    /// apply to them.
    pub fn requeue(&self, batch: Vec<Task>) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.lock();
        for task in batch.into_iter().rev() {
            state.buffer.push_front(task);
        }

        let mut deliveries = Vec::new();
        let mut reopened = None;
        while !state.buffer.is_empty() {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.tx.is_closed() {
                continue;
            }
            let (batch, drop_count) = self.drain_front(&mut state, waiter.maxbatch);
            reopened = reopened.or(drop_count);
            deliveries.push((waiter.tx, batch));
        }
        drop(state);

        for (tx, batch) in deliveries {
            self.deliver(tx, batch);
        }
        self.announce_reopened(reopened);
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            len: state.buffer.len(),
            waiting: state.waiters.len(),
            active: state.active,
            drop_count: state.drop_count,
            accept_count: state.accept_count,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Pops up to `maxbatch` tasks. Returns the drop count to report if this drain reopened
    /// the queue.
    fn drain_front(&self, state: &mut State, maxbatch: usize) -> (Vec<Task>, Option<usize>) {
        let take = maxbatch.min(state.buffer.len());
        let batch: Vec<Task> = state.buffer.drain(..take).collect();

        let mut reopened = None;
        if !state.active && state.buffer.len() <= self.inner.low {
            state.active = true;
            reopened = Some(std::mem::take(&mut state.drop_count));
        }
        (batch, reopened)
    }

    fn announce_reopened(&self, reopened: Option<usize>) {
        let Some(dropped) = reopened else {
            return;
        };
        tracing::info!(dropped, "Queue drained to low watermark, accepting tasks again");
        if let Some(callback) = self.inner.on_low.clone() {
            self.inner.scheduler.run_soon(Box::new(move || callback(dropped)));
        }
    }

    fn deliver(&self, tx: oneshot::Sender<Vec<Task>>, batch: Vec<Task>) {
        let queue = self.clone();
        self.inner.scheduler.run_soon(Box::new(move || {
            // The consumer went away between asking and being served. Keep its tasks.
            if let Err(batch) = tx.send(batch) {
                queue.requeue(batch);
            }
        }));
    }
}
