//! # Work Queues
//!
//! Named, bounded queues drained by a fixed set of worker threads. The reactor
//! hands every ready socket to one of these, and the transaction layer uses
//! them to decouple request processing from I/O.
//!
//! When a queue is full its [`DiscardPolicy`] decides which unit of work is
//! dropped. [`WorkQueue::nqueue`] returns the dropped unit to the caller so it
//! can run the unit's abort path (for a SIP request, that usually means
//! synthesizing a rejection).
//!
//! Each unit receives a [`WorkerContext`] carrying the index of the worker
//! thread running it. Per-worker resources (such as the UDP send sockets) are
//! looked up by that index.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::config::{DiscardPolicy, QueueConfig};
use crate::error::Result;

const GROWTH_FACTOR: f64 = 1.2;
const HIGH_WATER_PERCENT: usize = 80;

/// Passed to every unit of work
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub queue: Arc<str>,
}

/// Something a worker thread can run
pub trait UnitOfWork: Send {
    fn run(self: Box<Self>, ctx: &WorkerContext);

    /// Called instead of `run` when the unit is discarded
    fn abort(self: Box<Self>) {}
}

/// Adapts a closure into a unit of work with a no-op abort
pub struct FnWork<F>(pub F);

impl<F> UnitOfWork for FnWork<F>
where
    F: FnOnce(&WorkerContext) + Send,
{
    fn run(self: Box<Self>, ctx: &WorkerContext) {
        (self.0)(ctx)
    }
}

pub fn work<F>(f: F) -> Box<dyn UnitOfWork>
where
    F: FnOnce(&WorkerContext) + Send + 'static,
{
    Box::new(FnWork(f))
}

struct QueueState {
    items: VecDeque<Box<dyn UnitOfWork>>,
    max_size: usize,
    above_high_water: bool,
    overflowing: bool,
}

pub struct WorkQueue {
    name: Arc<str>,
    policy: DiscardPolicy,
    state: Mutex<QueueState>,
    available: Condvar,
    max_threads: AtomicUsize,
    workers: Mutex<Vec<Option<JoinHandle<()>>>>,
    busy: AtomicUsize,
    dropped: AtomicU64,
    dropped_since_overflow: AtomicU64,
    shutdown: AtomicBool,
}

impl WorkQueue {
    pub fn new(config: &QueueConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            name: Arc::from(config.name.as_str()),
            policy: config.discard_policy,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(config.max_size.min(4096)),
                max_size: config.max_size,
                above_high_water: false,
                overflowing: false,
            }),
            available: Condvar::new(),
            max_threads: AtomicUsize::new(config.max_threads),
            workers: Mutex::new(Vec::new()),
            busy: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            dropped_since_overflow: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn discard_policy(&self) -> DiscardPolicy {
        self.policy
    }

    /// Spawns worker threads up to the configured maximum
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let max = self.max_threads.load(Ordering::Acquire);
        let mut workers = self.workers.lock();
        while workers.len() < max {
            workers.push(None);
        }
        for worker_id in 0..max {
            let alive = workers[worker_id]
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());
            if alive {
                continue;
            }
            let queue = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, worker_id))
                .spawn(move || queue.worker_loop(worker_id))?;
            workers[worker_id] = Some(handle);
        }
        debug!(queue = %self.name, threads = max, "work queue started");
        Ok(())
    }

    /// Adds a unit of work, returning whichever unit was discarded
    pub fn nqueue(&self, unit: Box<dyn UnitOfWork>) -> Option<Box<dyn UnitOfWork>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Some(unit);
        }
        let mut state = self.state.lock();
        let mut discarded = None;

        if state.items.len() >= state.max_size {
            match self.policy {
                DiscardPolicy::GrowWithoutBound => {
                    let grown = ((state.max_size as f64) * GROWTH_FACTOR).ceil() as usize;
                    let grown = grown.max(state.max_size + 1);
                    debug!(queue = %self.name, from = state.max_size, to = grown, "growing queue");
                    state.max_size = grown;
                    state.items.push_back(unit);
                }
                DiscardPolicy::DiscardNewest => {
                    discarded = Some(unit);
                }
                DiscardPolicy::DiscardOldest => {
                    discarded = state.items.pop_front();
                    state.items.push_back(unit);
                }
            }
        } else {
            state.items.push_back(unit);
        }

        if discarded.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let since = self.dropped_since_overflow.fetch_add(1, Ordering::Relaxed) + 1;
            if !state.overflowing {
                state.overflowing = true;
                warn!(queue = %self.name, size = state.items.len(), "Queue Overflow - UOW dropped");
            } else {
                trace!(queue = %self.name, dropped_since_overflow = since, "UOW dropped");
            }
        } else if state.overflowing {
            state.overflowing = false;
            let since = self.dropped_since_overflow.swap(0, Ordering::Relaxed);
            info!(queue = %self.name, dropped = since, "queue accepting work again");
        }

        let high_water = state.max_size * HIGH_WATER_PERCENT / 100;
        if state.items.len() >= high_water && !state.above_high_water {
            state.above_high_water = true;
            warn!(
                queue = %self.name,
                size = state.items.len(),
                max = state.max_size,
                "queue above high-water mark"
            );
        } else if state.items.len() < high_water {
            state.above_high_water = false;
        }

        drop(state);
        self.available.notify_one();
        discarded
    }

    /// Enqueues and aborts whatever was discarded
    pub fn submit(&self, unit: Box<dyn UnitOfWork>) {
        if let Some(dropped) = self.nqueue(unit) {
            dropped.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_since_overflow(&self) -> u64 {
        self.dropped_since_overflow.load(Ordering::Relaxed)
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    pub fn set_max_size(&self, max_size: usize) {
        let max_size = max_size.max(1);
        self.state.lock().max_size = max_size;
        debug!(queue = %self.name, max_size, "set_max_size");
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::Acquire)
    }

    /// Changes the worker count; surplus workers exit after their current unit
    pub fn set_max_threads(self: &Arc<Self>, max_threads: usize) -> Result<()> {
        let max_threads = max_threads.max(1);
        let previous = self.max_threads.swap(max_threads, Ordering::AcqRel);
        debug!(queue = %self.name, from = previous, to = max_threads, "set_max_threads");
        self.available.notify_all();
        let started = !self.workers.lock().is_empty();
        if started && max_threads > previous {
            self.start()?;
        }
        Ok(())
    }

    /// Stops the workers and aborts anything still queued
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.available.notify_all();
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).flatten().collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        let pending: Vec<Box<dyn UnitOfWork>> = self.state.lock().items.drain(..).collect();
        if !pending.is_empty() {
            debug!(queue = %self.name, pending = pending.len(), "aborting pending work");
        }
        for unit in pending {
            unit.abort();
        }
    }

    fn next_unit(&self, worker_id: usize) -> Option<Box<dyn UnitOfWork>> {
        let mut state = self.state.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if worker_id >= self.max_threads.load(Ordering::Acquire) {
                return None;
            }
            if let Some(unit) = state.items.pop_front() {
                return Some(unit);
            }
            self.available.wait(&mut state);
        }
    }

    fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let ctx = WorkerContext {
            worker_id,
            queue: self.name.clone(),
        };
        trace!(queue = %self.name, worker_id, "worker started");
        while let Some(unit) = self.next_unit(worker_id) {
            self.busy.fetch_add(1, Ordering::AcqRel);
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unit.run(&ctx)));
            self.busy.fetch_sub(1, Ordering::AcqRel);
            if outcome.is_err() {
                error!(queue = %self.name, worker_id, "unit of work panicked");
            }
        }
        trace!(queue = %self.name, worker_id, "worker exiting");
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
