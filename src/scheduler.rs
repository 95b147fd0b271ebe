//! Bounded priority executor for transfer bodies.
//!
//! Units are ordered by priority (higher first), then by submission order
//! within the same priority. A fixed number of worker loops pull from the
//! shared heap, so at most `workers` units run at once. A unit can be
//! withdrawn while it is still pending; once a worker has taken it, it runs
//! to completion.

use futures_util::FutureExt;
use log::{debug, error, warn};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub type UnitFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle of a submitted unit, used to withdraw it before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct QueuedUnit {
    id: UnitId,
    priority: i32,
    sequence: u64,
    future: UnitFuture,
}

impl PartialEq for QueuedUnit {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedUnit {}

impl PartialOrd for QueuedUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority wins, then the older sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<QueuedUnit>>,
    notify: Notify,
    next_sequence: AtomicU64,
    active: AtomicUsize,
    shutdown: AtomicBool,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, BinaryHeap<QueuedUnit>> {
        // a panicking unit never holds this lock, so poisoning carries no torn state
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct PriorityScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityScheduler {
    /// Spawns `workers` loops on the current tokio runtime.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_sequence: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let handles = (0..workers)
            .map(|index| tokio::spawn(worker_loop(index, Arc::clone(&shared))))
            .collect();
        debug!("[Scheduler] Started {} workers", workers);

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    pub fn submit<F>(&self, priority: i32, future: F) -> UnitId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sequence = self
            .shared
            .next_sequence
            .fetch_add(1, AtomicOrdering::Relaxed);
        let id = UnitId(sequence);

        if self.shared.shutdown.load(AtomicOrdering::Acquire) {
            warn!("[Scheduler] Unit {} submitted after shutdown, dropped", id);
            return id;
        }

        self.shared.queue().push(QueuedUnit {
            id,
            priority,
            sequence,
            future: Box::pin(future),
        });
        self.shared.notify.notify_one();
        debug!("[Scheduler] Queued unit {} with priority {}", id, priority);
        id
    }

    /// Withdraws a pending unit. Returns false when it already started or is unknown.
    pub fn remove(&self, id: UnitId) -> bool {
        let mut queue = self.shared.queue();
        let before = queue.len();
        queue.retain(|unit| unit.id != id);
        let removed = queue.len() != before;
        if removed {
            debug!("[Scheduler] Withdrew unit {}", id);
        }
        removed
    }

    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn active(&self) -> usize {
        self.shared.active.load(AtomicOrdering::Acquire)
    }

    /// Drops every pending unit and stops the workers once their current unit ends.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        let dropped = {
            let mut queue = self.shared.queue();
            let n = queue.len();
            queue.clear();
            n
        };
        self.shared.notify.notify_waiters();

        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("[Scheduler] Worker ended abnormally: {}", e);
            }
        }
        debug!("[Scheduler] Shut down, {} pending units dropped", dropped);
    }
}

impl Drop for PriorityScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        self.shared.notify.notify_waiters();
    }
}

impl fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityScheduler")
            .field("pending", &self.pending())
            .field("active", &self.active())
            .finish()
    }
}

async fn worker_loop(index: usize, shared: Arc<Shared>) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = shared.queue().pop();
        if let Some(unit) = next {
            shared.active.fetch_add(1, AtomicOrdering::AcqRel);
            debug!("[Scheduler] Worker {} runs unit {}", index, unit.id);
            if AssertUnwindSafe(unit.future).catch_unwind().await.is_err() {
                error!("[Scheduler] Unit {} panicked on worker {}", unit.id, index);
            }
            shared.active.fetch_sub(1, AtomicOrdering::AcqRel);
            continue;
        }

        if shared.shutdown.load(AtomicOrdering::Acquire) {
            break;
        }
        notified.await;
    }
    debug!("[Scheduler] Worker {} stopped", index);
}
