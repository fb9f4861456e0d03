//! De-duplicating Work Queue
//!
//! ```text
//!   add(x) ──> dirty{x} ──> queue[x] ──get──> processing{x} ──done──┐
//!                 ▲                                                 │
//!                 └──── re-added while processing: queued again ◄───┘
//! ```
//!
//! - An item waiting in the queue is never queued twice.
//! - An item is handed to at most one worker at a time.
//! - An item added while it is being processed is queued again once the
//!   worker calls [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use super::rate_limit::RateLimiter;

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Items that need processing, queued or not
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    shutdown: watch::Sender<bool>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(limiter: impl RateLimiter<K> + 'static) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
            shutdown,
        }
    }

    /// Mark an item as needing processing
    pub fn add(&self, item: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next item; `None` once the queue is shut down
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing; requeues the item if it was re-added meanwhile
    pub fn done(&self, item: &K) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clear the item's retry history
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    pub fn retries(&self, item: &K) -> u32 {
        self.limiter.retries(item)
    }

    /// Re-add after the rate limiter's delay for this item
    pub fn add_rate_limited(self: &Arc<Self>, item: K) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Re-add after `delay`; the pending add is dropped on shutdown
    pub fn add_after(self: &Arc<Self>, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            // retry backoff delay, cancelled by shutdown
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.add(item),
                _ = shutdown.wait_for(|stop| *stop) => {}
            }
        });
    }

    /// Stop handing out items and wake every waiting worker
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.shutdown.send_replace(true);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Items waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}
