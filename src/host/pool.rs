//! A fixed pool of worker threads over a shared lock-free queue.
//!
//! Jobs are pushed onto a `SegQueue`; idle workers park on a condvar and are
//! woken one per job. [`WorkerPool::spawn`] wraps a closure in a [`Task`], so
//! coroutines can await pool work like any other retained-result task.

use crate::affinity::{unavailable, Job};
use crate::config::HostConfig;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::host::Task;
use crate::tracing_compat::{debug, error};
use crate::types::PanicPayload;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

static NEXT_POOL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

pub(crate) struct PoolInner {
    id: u64,
    prefix: Arc<str>,
    queue: SegQueue<Job>,
    lock: Mutex<()>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl PoolInner {
    /// Returns true when called from one of this pool's workers.
    pub(crate) fn is_current(&self) -> bool {
        CURRENT_POOL.with(Cell::get) == self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn post(&self, job: Job) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(unavailable(&self.prefix));
        }
        self.queue.push(job);
        let _guard = self.lock.lock();
        self.available.notify_one();
        Ok(())
    }

    fn worker_loop(&self) {
        CURRENT_POOL.with(|current| current.set(self.id));
        loop {
            while let Some(job) = self.queue.pop() {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                    let payload = PanicPayload::from_unwind(payload.as_ref());
                    let _ = &payload;
                    error!(pool = %self.prefix, panic = %payload.message(), "pool job panicked");
                }
            }
            let mut guard = self.lock.lock();
            if self.queue.is_empty() {
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                self.available.wait(&mut guard);
            }
        }
    }
}

/// A pool of worker threads.
///
/// Dropping the pool shuts it down: queued jobs finish, then the workers
/// are joined.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Starts `workers` threads with otherwise default settings.
    pub fn new(workers: usize) -> Result<Self> {
        Self::from_config(&HostConfig::default().with_worker_threads(workers))
    }

    /// Starts a pool configured from the `COADAPT_*` environment.
    pub fn from_env() -> Result<Self> {
        let config = HostConfig::from_env().context("worker pool configuration")?;
        Self::from_config(&config)
    }

    /// Starts a pool sized and named by `config`.
    pub fn from_config(config: &HostConfig) -> Result<Self> {
        let mut config = config.clone();
        config.normalize();
        let inner = Arc::new(PoolInner {
            id: NEXT_POOL.fetch_add(1, Ordering::Relaxed),
            prefix: config.thread_name_prefix.as_str().into(),
            queue: SegQueue::new(),
            lock: Mutex::new(()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let pool = Self {
            inner,
            workers: Mutex::new(Vec::with_capacity(config.worker_threads)),
            size: config.worker_threads,
        };
        for index in 0..config.worker_threads {
            let inner = Arc::clone(&pool.inner);
            let handle = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name_prefix))
                .stack_size(config.thread_stack_size)
                .spawn(move || inner.worker_loop())
                .map_err(|e| {
                    Error::new(ErrorKind::ThreadUnavailable)
                        .with_message(format!("failed to spawn pool worker {index}"))
                        .with_source(e)
                })?;
            pool.workers.lock().push(handle);
        }
        debug!(pool = %pool.inner.prefix, workers = pool.size, "worker pool started");
        Ok(pool)
    }

    /// Runs `f` on a worker. The returned task completes with its value, or
    /// fails with `Panicked` if `f` panics.
    pub fn spawn<T, F>(&self, f: F) -> Task<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (completer, task) = Task::pending();
        if self.is_shutdown() {
            completer.fail(unavailable(&self.inner.prefix));
            return task;
        }
        let job: Job = Box::new(move || match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => completer.complete(value),
            Err(payload) => {
                completer.fail(Error::panicked(&PanicPayload::from_unwind(payload.as_ref())));
            }
        });
        if let Err(e) = self.inner.post(job) {
            let _ = &e;
            debug!(error = %e, "pool shut down while spawning");
        }
        task
    }

    /// Enqueues `job` on the pool.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.inner.post(Box::new(job))
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.size
    }

    /// Returns true when called from one of this pool's workers.
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        self.inner.is_current()
    }

    /// Returns true once the pool stopped accepting jobs.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn shared(&self) -> Arc<PoolInner> {
        Arc::clone(&self.inner)
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the workers.
    ///
    /// Called from a worker, the workers are left to exit on their own.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.inner.lock.lock();
            self.inner.available.notify_all();
        }
        if self.is_worker_thread() {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!(pool = %self.inner.prefix, "pool worker panicked");
            }
        }
        debug!(pool = %self.inner.prefix, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("prefix", &self.inner.prefix)
            .field("workers", &self.size)
            .field("pending", &self.inner.queue.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{env_lock, init_test_logging};
    use std::error::Error as _;
    use std::collections::HashSet;
    use std::sync::mpsc;

    #[test]
    fn spawn_completes_task_on_worker() {
        init_test_logging();
        let pool = WorkerPool::new(2).expect("pool");
        let task = pool.spawn(|| (6 * 7, thread::current().name().map(String::from)));
        let lease = task.wait().expect("value");
        let (value, name) = lease.get().expect("live").clone();
        assert_eq!(value, 42);
        assert!(name.expect("named").starts_with("coadapt-worker-"));
    }

    #[test]
    fn panic_fails_the_task() {
        let pool = WorkerPool::new(1).expect("pool");
        let task: Task<u32> = pool.spawn(|| panic!("worker job failed"));
        let err = task.wait().expect_err("panicked");
        assert_eq!(err.kind(), ErrorKind::Panicked);
        let after = pool.spawn(|| 1_u32);
        assert_eq!(*after.wait().expect("pool survives").get().expect("live"), 1);
    }

    #[test]
    fn jobs_spread_over_named_workers() {
        let config = HostConfig::default()
            .with_worker_threads(3)
            .with_thread_name_prefix("spread");
        let pool = WorkerPool::from_config(&config).expect("pool");
        assert_eq!(pool.worker_count(), 3);
        let (tx, rx) = mpsc::channel();
        for _ in 0..30 {
            let tx = tx.clone();
            pool.post(move || {
                tx.send(thread::current().name().map(String::from)).expect("send");
            })
            .expect("post");
        }
        let names: HashSet<_> = (0..30).map(|_| rx.recv().expect("recv")).collect();
        assert!(names.iter().all(|n| n.as_deref().is_some_and(|n| n.starts_with("spread-"))));
    }

    #[test]
    fn is_worker_thread_distinguishes_pools() {
        let a = WorkerPool::new(1).expect("pool");
        let b = Arc::new(WorkerPool::new(1).expect("pool"));
        assert!(!a.is_worker_thread());
        let (tx, rx) = mpsc::channel();
        let probe = Arc::clone(&b);
        b.post(move || tx.send(probe.is_worker_thread()).expect("send"))
            .expect("post");
        assert!(rx.recv().expect("recv"));
        let (tx, rx) = mpsc::channel();
        let probe = a.shared();
        b.post(move || tx.send(probe.is_current()).expect("send"))
            .expect("post");
        assert!(!rx.recv().expect("recv"));
    }

    #[test]
    fn shutdown_drains_then_rejects() {
        let pool = WorkerPool::new(2).expect("pool");
        let tasks: Vec<_> = (0..8_u32).map(|i| pool.spawn(move || i)).collect();
        pool.shutdown();
        for (i, task) in (0_u32..).zip(&tasks) {
            assert_eq!(*task.try_get().expect("ran").expect("ok").get().expect("live"), i);
        }
        let err = pool.post(|| {}).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::ThreadUnavailable);
        let late: Task<u32> = pool.spawn(|| 0);
        assert_eq!(
            late.wait().expect_err("rejected").kind(),
            ErrorKind::ThreadUnavailable
        );
    }

    #[test]
    fn from_env_sizes_and_names_workers() {
        let _guard = env_lock();
        std::env::set_var("COADAPT_WORKER_THREADS", "2");
        std::env::set_var("COADAPT_THREAD_NAME_PREFIX", "env-pool");
        let pool = WorkerPool::from_env();
        std::env::remove_var("COADAPT_WORKER_THREADS");
        std::env::remove_var("COADAPT_THREAD_NAME_PREFIX");
        let pool = pool.expect("pool");
        assert_eq!(pool.worker_count(), 2);
        let (tx, rx) = mpsc::channel();
        pool.post(move || tx.send(thread::current().name().map(String::from)).expect("send"))
            .expect("post");
        let name = rx.recv().expect("recv").expect("named worker");
        assert!(name.starts_with("env-pool-"), "{name}");
    }

    #[test]
    fn from_env_reports_bad_values_with_context() {
        let _guard = env_lock();
        std::env::set_var("COADAPT_WORKER_THREADS", "lots");
        let result = WorkerPool::from_env();
        std::env::remove_var("COADAPT_WORKER_THREADS");
        let err = result.expect_err("unparseable worker count");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.message(), Some("worker pool configuration"));
        let cause = err.source().expect("config error kept as source");
        assert!(cause.to_string().contains("COADAPT_WORKER_THREADS"), "{cause}");
    }
}
