//! Deduplicating, delay-capable work queue.
//!
//! Semantics follow the client-go rate-limited queue:
//! - an item is at most once in the queue, however often it is added;
//! - an item handed out by [`WorkQueue::get`] is not handed out again until
//!   [`WorkQueue::done`] is called, so one key is never processed twice at
//!   the same time; adds while processing are replayed on `done`;
//! - delayed adds keep only the earliest pending deadline per item;
//! - rate-limited adds back off exponentially per item until `forget`.

use crate::backoff::ExponentialBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: HashMap<T, Instant>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

/// Callback receiving the number of ready items after every change.
pub type DepthObserver = Box<dyn Fn(usize) + Send + Sync>;

/// Work queue shared by the event handlers and the reconcile workers.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    backoff: ExponentialBackoff,
    depth_observer: Option<DepthObserver>,
}

impl<T: fmt::Debug> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("state", &self.state)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates an empty queue using `backoff` for rate-limited adds.
    #[cfg(test)]
    pub fn new(backoff: ExponentialBackoff) -> Arc<Self> {
        Self::build(backoff, None)
    }

    /// Creates an empty queue that reports the ready count to `observer`
    /// whenever it changes.
    pub fn with_depth_observer(backoff: ExponentialBackoff, observer: DepthObserver) -> Arc<Self> {
        Self::build(backoff, Some(observer))
    }

    fn build(backoff: ExponentialBackoff, depth_observer: Option<DepthObserver>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
            depth_observer,
        })
    }

    fn publish_depth(&self, depth: usize) {
        if let Some(observer) = &self.depth_observer {
            observer(depth);
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `item` as needing processing.
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        let depth = state.queue.len();
        drop(state);
        self.publish_depth(depth);
        self.notify.notify_one();
    }

    /// Adds `item` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if state.waiting.get(&item).is_some_and(|existing| *existing <= ready_at) {
                return;
            }
            state.waiting.insert(item.clone(), ready_at);
        }

        let queue: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            if let Some(queue) = queue.upgrade() {
                queue.fire_waiting(item, ready_at);
            }
        });
    }

    fn fire_waiting(&self, item: T, ready_at: Instant) {
        {
            let mut state = self.lock();
            // A later, earlier-deadline add_after superseded this timer
            if state.waiting.get(&item) != Some(&ready_at) {
                return;
            }
            state.waiting.remove(&item);
        }
        self.add(item);
    }

    /// Adds `item` after its per-item backoff and bumps its failure count.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let failures = {
            let mut state = self.lock();
            let count = state.failures.entry(item.clone()).or_insert(0);
            let previous = *count;
            *count = count.saturating_add(1);
            previous
        };
        self.add_after(item, self.backoff.delay_for(failures));
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    /// Number of rate-limited adds since the last `forget`.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let depth = state.queue.len();
                    drop(state);
                    self.publish_depth(depth);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as processed, re-queueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            let depth = state.queue.len();
            drop(state);
            self.publish_depth(depth);
            self.notify.notify_one();
        }
    }

    /// Number of items ready to be handed out.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True when no item is ready.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out items and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// True once [`WorkQueue::shut_down`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
