//! Bounded blocking queues.
//!
//! A [`PriorityQueue`] holds N levels, each a FIFO with its own capacity.
//! `push` waits only on its own level being full; `pop` always takes the
//! oldest item of the lowest-numbered non-empty level. A [`BoundedQueue`] is
//! the single-level case.
//!
//! Membership is guarded by one mutex. Waiters register interest with
//! [`Notify`] *before* re-checking the predicate under the lock, and loop
//! until it holds, so a wakeup is never lost and a spurious one is harmless.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

/// Returned by `push` after the queue was closed; gives the item back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closed<T>(pub T);

struct State<T> {
    levels: Vec<VecDeque<T>>,
    closed: bool,
}

/// Fixed-capacity multi-level FIFO.
pub struct PriorityQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Vec<Notify>,
}

impl<T> PriorityQueue<T> {
    /// Create a queue with `levels` priority levels of `capacity` each.
    pub fn new(levels: usize, capacity: usize) -> Self {
        let levels = levels.max(1);
        Self {
            state: Mutex::new(State {
                levels: (0..levels).map(|_| VecDeque::with_capacity(capacity)).collect(),
                closed: false,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: (0..levels).map(|_| Notify::new()).collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A panic while holding this lock cannot leave the deques half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn level(&self, level: usize) -> usize {
        level.min(self.not_full.len() - 1)
    }

    /// Number of priority levels.
    pub fn levels(&self) -> usize {
        self.not_full.len()
    }

    /// Per-level capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total queued items.
    pub fn len(&self) -> usize {
        self.lock().levels.iter().map(VecDeque::len).sum()
    }

    /// Whether every level is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert at `level`, waiting while that level is full.
    ///
    /// Levels past the last are clamped to the last.
    pub async fn push(&self, level: usize, item: T) -> Result<(), Closed<T>> {
        let level = self.level(level);
        let mut item = Some(item);
        loop {
            let notified = self.not_full[level].notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(value) = item.take() {
                    if state.closed {
                        return Err(Closed(value));
                    }
                    if state.levels[level].len() < self.capacity {
                        state.levels[level].push_back(value);
                        self.not_empty.notify_one();
                        return Ok(());
                    }
                    item = Some(value);
                }
            }

            notified.await;
        }
    }

    /// Insert without waiting; hands the item back if the level is full.
    pub fn try_push(&self, level: usize, item: T) -> Result<(), T> {
        let level = self.level(level);
        let mut state = self.lock();
        if state.closed || state.levels[level].len() >= self.capacity {
            return Err(item);
        }
        state.levels[level].push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the next item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = self.take_next(&mut state) {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Remove the next item if one is queued.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        self.take_next(&mut state)
    }

    fn take_next(&self, state: &mut State<T>) -> Option<T> {
        let (level, item) = state
            .levels
            .iter_mut()
            .enumerate()
            .find_map(|(idx, queue)| queue.pop_front().map(|item| (idx, item)))?;
        self.not_full[level].notify_one();
        if state.levels.iter().any(|q| !q.is_empty()) {
            // Hand the baton on in case several consumers are parked.
            self.not_empty.notify_one();
        }
        Some(item)
    }

    /// Reject further pushes and wake every waiter.
    ///
    /// Items already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        for notify in &self.not_full {
            notify.notify_waiters();
        }
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Single-level fixed-capacity FIFO.
pub struct BoundedQueue<T>(PriorityQueue<T>);

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self(PriorityQueue::new(1, capacity))
    }

    /// Insert, waiting while full.
    pub async fn push(&self, item: T) -> Result<(), Closed<T>> {
        self.0.push(0, item).await
    }

    /// Insert without waiting.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.0.try_push(0, item)
    }

    /// Remove the oldest item, waiting while empty.
    pub async fn pop(&self) -> Option<T> {
        self.0.pop().await
    }

    /// Remove the oldest item if any.
    pub fn try_pop(&self) -> Option<T> {
        self.0.try_pop()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn close(&self) {
        self.0.close()
    }
}
