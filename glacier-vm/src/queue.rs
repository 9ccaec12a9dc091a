//! The FIFO of pending background compilations.

use std::collections::VecDeque;

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};

use glacier_cpu::ExecutionMode;
use glacier_jit::Tier;

use crate::cache::CacheKey;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueItem {
    pub address: u64,
    pub mode: ExecutionMode,
    pub tier: Tier,

    /// Compile every block reachable from `address` instead of just the first one.
    pub full_graph: bool,
}

impl QueueItem {
    /// A request to recompile the routine at `address` with the full-graph pipeline.
    pub fn optimize(address: u64, mode: ExecutionMode) -> Self {
        Self { address, mode, tier: Tier::Optimized, full_graph: true }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.address, self.mode)
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,

    /// Requests that are queued or being compiled.
    pending: HashSet<(CacheKey, Tier)>,

    shutdown: bool,

    /// The number of registered execution threads. The queue is shut down when it drops to zero.
    threads: usize,

    /// Set while a worker thread is consuming the queue, cleared by the worker under the same lock
    /// that decides it has nothing left to do.
    worker_alive: bool,
}

impl QueueState {
    fn close(&mut self) {
        self.shutdown = true;
        self.items.clear();
        self.pending.clear();
    }
}

#[derive(Default)]
pub(crate) struct Queue {
    state: Mutex<QueueState>,

    /// Signalled when an item is pushed or the queue is shut down.
    ready: Condvar,

    /// Signalled when the last pending item finishes.
    idle: Condvar,
}

impl Queue {
    /// A queue that rejects items until a thread is registered with [Queue::add_thread].
    pub fn closed() -> Self {
        let queue = Self::default();
        queue.state.lock().shutdown = true;
        queue
    }

    /// Adds `item` to the back of the queue, returns `false` if an identical request is already
    /// pending or the queue was shut down.
    pub fn push(&self, item: QueueItem) -> bool {
        let mut state = self.state.lock();
        if state.shutdown || !state.pending.insert((item.key(), item.tier)) {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Blocks until an item is available, returns `None` once the queue is shut down.
    pub fn pop(&self) -> Option<QueueItem> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                state.worker_alive = false;
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Marks a popped item as done, allowing it to be requested again.
    pub fn finish(&self, item: &QueueItem) {
        let mut state = self.state.lock();
        state.pending.remove(&(item.key(), item.tier));
        if state.pending.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Blocks until every pending item has been compiled or the queue is shut down.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while !state.pending.is_empty() && !state.shutdown {
            self.idle.wait(&mut state);
        }
    }

    /// Drops every pending item and wakes the worker so it can exit.
    pub fn shutdown(&self) {
        self.state.lock().close();
        self.wake_all();
    }

    /// Shuts the queue down on behalf of a worker that could not run.
    pub fn abandon(&self) {
        let mut state = self.state.lock();
        state.close();
        state.worker_alive = false;
        drop(state);
        self.wake_all();
    }

    fn wake_all(&self) {
        self.ready.notify_all();
        self.idle.notify_all();
    }

    /// Returns `true` if the caller should start a worker, in which case the queue counts it as
    /// alive until its `pop` returns `None` or [Queue::abandon] is called.
    pub fn claim_worker(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown || state.worker_alive {
            return false;
        }
        state.worker_alive = true;
        true
    }

    /// Registers an execution thread, reopening the queue for the first one.
    pub fn add_thread(&self) {
        let mut state = self.state.lock();
        state.threads += 1;
        if state.threads == 1 {
            state.shutdown = false;
        }
    }

    /// Unregisters an execution thread, shutting the queue down after the last one. Returns
    /// whether it was the last.
    pub fn remove_thread(&self) -> bool {
        let mut state = self.state.lock();
        state.threads = state.threads.saturating_sub(1);
        if state.threads != 0 {
            return false;
        }
        state.close();
        drop(state);
        self.wake_all();
        true
    }

    pub fn threads(&self) -> usize {
        self.state.lock().threads
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}
