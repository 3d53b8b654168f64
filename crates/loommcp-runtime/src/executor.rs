//! Work-stealing thread pool.
//!
//! One Chase-Lev deque per worker plus a shared injector for tasks submitted
//! from outside the pool. A worker pops its own deque from the bottom; idle
//! workers steal from the injector or from the top of a victim's deque.
//! Victim selection scans for the longest deque every eighth attempt,
//! otherwise it retries the last successful victim or picks one at random.
//!
//! There is no FIFO guarantee between independent tasks: the owner side of a
//! deque is LIFO while the steal side is FIFO, and handlers must not depend
//! on cross-request ordering.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Default bound on the graceful-shutdown drain.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff ceiling for idle workers.
const MAX_BACKOFF_MS: u64 = 100;
/// Consecutive failed steals before the backoff resets, in case a wake-up
/// signal was missed.
const STEAL_FAILURES_BEFORE_RESET: u32 = 30;
/// Scan all deques for the longest one every this many steal attempts.
const SCAN_INTERVAL: u64 = 8;

const RUNNING: u8 = 0;
const IMMEDIATE: u8 = 1;
const GRACEFUL: u8 = 2;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Errors surfaced by [`ThreadPool`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was created with zero workers; nothing can ever run.
    #[error("thread pool has no workers")]
    NoWorkers,
    /// The pending-task bound was reached.
    #[error("task queue is full")]
    QueueFull,
    /// The pool is shutting down or already shut down.
    #[error("thread pool is shut down")]
    ShutDown,
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// How to stop the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drain every queued and running task, bounded by the graceful timeout.
    Graceful,
    /// Stop as soon as each worker finishes its current task; queued tasks
    /// are dropped.
    Immediate,
}

#[derive(Default)]
struct WorkerStats {
    executed: AtomicU64,
    stolen: AtomicU64,
}

struct PoolShared {
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    shutdown: AtomicU8,
    /// Tasks queued but not yet started.
    pending: AtomicUsize,
    /// Tasks currently executing.
    active: AtomicUsize,
    capacity: usize,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
    stats: Vec<WorkerStats>,
}

impl PoolShared {
    fn is_drained(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && self.active.load(Ordering::Acquire) == 0
    }
}

struct LocalWorker {
    pool_token: usize,
    worker: Worker<Task>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalWorker>> = const { RefCell::new(None) };
}

/// A snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total tasks executed.
    pub executed: u64,
    /// Tasks obtained by stealing rather than local pop.
    pub stolen: u64,
    /// Tasks queued but not started.
    pub pending: usize,
    /// Tasks currently executing.
    pub active: usize,
}

/// A work-stealing pool of OS threads.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    graceful_timeout: Duration,
}

impl ThreadPool {
    /// Spawn a pool of `thread_count` workers, each with a deque bounded to
    /// `queue_size` pending tasks (enforced as a pool-wide bound of
    /// `thread_count * queue_size`).
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] when the OS refuses a worker thread.
    pub fn new(thread_count: usize, queue_size: usize) -> Result<Self, PoolError> {
        Self::with_graceful_timeout(thread_count, queue_size, DEFAULT_GRACEFUL_TIMEOUT)
    }

    /// Like [`ThreadPool::new`] with an explicit graceful-shutdown bound.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] when the OS refuses a worker thread.
    pub fn with_graceful_timeout(
        thread_count: usize,
        queue_size: usize,
        graceful_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let locals: Vec<Worker<Task>> = (0..thread_count).map(|_| Worker::new_lifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();
        let stats = (0..thread_count).map(|_| WorkerStats::default()).collect();

        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            stealers,
            shutdown: AtomicU8::new(RUNNING),
            pending: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            capacity: thread_count.saturating_mul(queue_size),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            stats,
        });

        let pool_token = Arc::as_ptr(&shared) as usize;
        let mut handles = Vec::with_capacity(thread_count);
        for (index, local) in locals.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("loommcp-worker-{index}"))
                .spawn(move || worker_loop(index, local, pool_token, &shared))
                .map_err(|e| PoolError::Spawn(e.to_string()))?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            graceful_timeout,
        })
    }

    /// Queue a task for execution.
    ///
    /// A call from a worker thread of this pool pushes onto that worker's
    /// own deque; any other caller goes through the shared injector.
    ///
    /// # Errors
    ///
    /// [`PoolError::NoWorkers`] for an empty pool, [`PoolError::ShutDown`]
    /// after shutdown began, [`PoolError::QueueFull`] at the pending bound.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.stealers.is_empty() {
            return Err(PoolError::NoWorkers);
        }
        if self.shared.shutdown.load(Ordering::Acquire) != RUNNING {
            return Err(PoolError::ShutDown);
        }
        if self.shared.pending.load(Ordering::Acquire) >= self.shared.capacity {
            return Err(PoolError::QueueFull);
        }

        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let mut task: Option<Task> = Some(Box::new(task));
        let pool_token = Arc::as_ptr(&self.shared) as usize;
        LOCAL.with(|slot| {
            if let Some(local) = slot.borrow().as_ref()
                && local.pool_token == pool_token
                && let Some(task) = task.take()
            {
                local.worker.push(task);
            }
        });
        if let Some(task) = task.take() {
            self.shared.injector.push(task);
        }
        self.shared.idle_cv.notify_one();
        Ok(())
    }

    /// Counter snapshot across all workers.
    pub fn stats(&self) -> PoolStats {
        let executed = self
            .shared
            .stats
            .iter()
            .map(|s| s.executed.load(Ordering::Relaxed))
            .sum();
        let stolen = self
            .shared
            .stats
            .iter()
            .map(|s| s.stolen.load(Ordering::Relaxed))
            .sum();
        PoolStats {
            executed,
            stolen,
            pending: self.shared.pending.load(Ordering::Relaxed),
            active: self.shared.active.load(Ordering::Relaxed),
        }
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Stop the pool and join every worker.
    ///
    /// Graceful mode drains queued and running tasks up to the configured
    /// timeout, then escalates to immediate.
    pub fn shutdown(&self, mode: ShutdownMode) {
        match mode {
            ShutdownMode::Immediate => {
                self.shared.shutdown.store(IMMEDIATE, Ordering::Release);
            }
            ShutdownMode::Graceful => {
                let _ = self.shared.shutdown.compare_exchange(
                    RUNNING,
                    GRACEFUL,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        self.shared.idle_cv.notify_all();

        if self.shared.shutdown.load(Ordering::Acquire) == GRACEFUL {
            let deadline = Instant::now() + self.graceful_timeout;
            let mut guard = self.shared.idle_lock.lock();
            while !self.shared.is_drained() {
                let now = Instant::now();
                if now >= deadline {
                    warn!("graceful shutdown timed out, escalating to immediate");
                    self.shared.shutdown.store(IMMEDIATE, Ordering::Release);
                    break;
                }
                self.shared
                    .idle_cv
                    .wait_for(&mut guard, (deadline - now).min(Duration::from_millis(50)));
            }
            drop(guard);
            self.shared.idle_cv.notify_all();
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
        debug!("thread pool shut down");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.workers.lock().is_empty() {
            self.shutdown(ShutdownMode::Graceful);
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.worker_count())
            .field("capacity", &self.shared.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(index: usize, local: Worker<Task>, pool_token: usize, shared: &Arc<PoolShared>) {
    LOCAL.with(|slot| {
        *slot.borrow_mut() = Some(LocalWorker {
            pool_token,
            worker: local,
        });
    });

    let mut backoff_ms: u64 = 1;
    let mut steal_attempts: u64 = 0;
    let mut consecutive_failures: u32 = 0;
    let mut last_victim: Option<usize> = None;

    loop {
        let flag = shared.shutdown.load(Ordering::Acquire);
        if flag == IMMEDIATE {
            break;
        }

        if let Some(task) = LOCAL.with(|slot| slot.borrow().as_ref().and_then(|l| l.worker.pop()))
        {
            run_task(index, shared, task);
            backoff_ms = 1;
            consecutive_failures = 0;
            continue;
        }

        if flag == GRACEFUL && shared.is_drained() {
            break;
        }

        steal_attempts += 1;
        match steal(index, shared, &mut last_victim, steal_attempts) {
            Some(task) => {
                shared.stats[index].stolen.fetch_add(1, Ordering::Relaxed);
                run_task(index, shared, task);
                backoff_ms = 1;
                consecutive_failures = 0;
            }
            None => {
                consecutive_failures += 1;
                if consecutive_failures >= STEAL_FAILURES_BEFORE_RESET {
                    // A wake-up may have been missed; start probing quickly
                    // again instead of sleeping at the ceiling.
                    backoff_ms = 1;
                    consecutive_failures = 0;
                }
                let jitter = fastrand::u64(0..=backoff_ms / 4 + 1);
                let wait = Duration::from_millis((backoff_ms + jitter).min(MAX_BACKOFF_MS));
                let mut guard = shared.idle_lock.lock();
                if shared.shutdown.load(Ordering::Acquire) == RUNNING
                    || (shared.shutdown.load(Ordering::Acquire) == GRACEFUL
                        && !shared.is_drained())
                {
                    shared.idle_cv.wait_for(&mut guard, wait);
                }
                drop(guard);
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }

    LOCAL.with(|slot| slot.borrow_mut().take());
    trace!(worker = index, "worker exiting");
}

fn steal(
    self_index: usize,
    shared: &PoolShared,
    last_victim: &mut Option<usize>,
    attempt: u64,
) -> Option<Task> {
    // The injector holds externally submitted tasks; drain it first.
    loop {
        match LOCAL.with(|slot| {
            let borrow = slot.borrow();
            let local = &borrow.as_ref().expect("worker TLS installed").worker;
            shared.injector.steal_batch_and_pop(local)
        }) {
            Steal::Success(task) => return Some(task),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }

    let victim = if attempt % SCAN_INTERVAL == 0 {
        // Periodically scan for the most loaded deque.
        shared
            .stealers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self_index)
            .max_by_key(|(_, s)| s.len())
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, _)| i)
    } else {
        last_victim
            .filter(|&v| v != self_index && !shared.stealers[v].is_empty())
            .or_else(|| random_victim(self_index, shared.stealers.len()))
    }?;

    loop {
        match shared.stealers[victim].steal() {
            Steal::Success(task) => {
                *last_victim = Some(victim);
                return Some(task);
            }
            Steal::Retry => continue,
            Steal::Empty => {
                *last_victim = None;
                return None;
            }
        }
    }
}

fn random_victim(self_index: usize, worker_count: usize) -> Option<usize> {
    if worker_count < 2 {
        return None;
    }
    let mut victim = fastrand::usize(0..worker_count - 1);
    if victim >= self_index {
        victim += 1;
    }
    Some(victim)
}

fn run_task(index: usize, shared: &PoolShared, task: Task) {
    shared.active.fetch_add(1, Ordering::AcqRel);
    shared.pending.fetch_sub(1, Ordering::AcqRel);

    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!(worker = index, "task panicked; worker continues");
    }

    shared.stats[index].executed.fetch_add(1, Ordering::Relaxed);
    shared.active.fetch_sub(1, Ordering::AcqRel);
    if shared.is_drained() {
        shared.idle_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn executes_submitted_tasks() {
        let pool = ThreadPool::new(4, 64).unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown(ShutdownMode::Graceful);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.stats().executed, 100);
    }

    #[test]
    fn zero_workers_rejects_submit() {
        let pool = ThreadPool::new(0, 16).unwrap();
        assert_eq!(pool.submit(|| ()).unwrap_err(), PoolError::NoWorkers);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = ThreadPool::new(1, 4).unwrap();
        pool.shutdown(ShutdownMode::Graceful);
        assert_eq!(pool.submit(|| ()).unwrap_err(), PoolError::ShutDown);
    }

    #[test]
    fn queue_bound_is_enforced() {
        let pool = ThreadPool::new(1, 2).unwrap();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        {
            let gate = Arc::clone(&gate);
            pool.submit(move || {
                let _g = gate.lock();
            })
            .unwrap();
        }
        // Give the worker time to start the blocking task, then fill the
        // two-slot queue.
        std::thread::sleep(Duration::from_millis(50));
        pool.submit(|| ()).unwrap();
        pool.submit(|| ()).unwrap();
        assert_eq!(pool.submit(|| ()).unwrap_err(), PoolError::QueueFull);
        drop(held);
        pool.shutdown(ShutdownMode::Graceful);
    }

    #[test]
    fn graceful_shutdown_drains_queue() {
        let pool = ThreadPool::new(2, 128).unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown(ShutdownMode::Graceful);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn graceful_timeout_escalates() {
        let pool =
            ThreadPool::with_graceful_timeout(1, 16, Duration::from_millis(100)).unwrap();
        pool.submit(|| std::thread::sleep(Duration::from_millis(400))).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        // Queued behind the sleeper; will be dropped by the escalation.
        pool.submit(|| ()).unwrap();
        let start = Instant::now();
        pool.shutdown(ShutdownMode::Graceful);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = ThreadPool::new(1, 16).unwrap();
        pool.submit(|| panic!("boom")).unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown(ShutdownMode::Graceful);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_submitted_from_workers_run() {
        let pool = Arc::new(ThreadPool::new(2, 64).unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        {
            let inner_pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                for _ in 0..10 {
                    let counter = Arc::clone(&counter);
                    inner_pool
                        .submit(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
            .unwrap();
        }
        // Allow the fan-out to land before draining.
        std::thread::sleep(Duration::from_millis(100));
        pool.shutdown(ShutdownMode::Graceful);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn stealing_happens_across_workers() {
        let pool = Arc::new(ThreadPool::new(4, 256).unwrap());
        let counter = Arc::new(AtomicU32::new(0));
        {
            let inner_pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            // One worker floods its own deque; others must steal.
            pool.submit(move || {
                for _ in 0..200 {
                    let counter = Arc::clone(&counter);
                    inner_pool
                        .submit(move || {
                            std::thread::sleep(Duration::from_micros(200));
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
            .unwrap();
        }
        std::thread::sleep(Duration::from_millis(300));
        pool.shutdown(ShutdownMode::Graceful);
        assert_eq!(counter.load(Ordering::SeqCst), 200);
        assert!(pool.stats().stolen > 0, "expected at least one steal");
    }
}
