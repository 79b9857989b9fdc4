//! FIFO job queues bound to one thread.
//!
//! A [`ThreadQueue`] is the post target behind every [`ThreadDescriptor`]
//! this crate hands out. Either it owns a dedicated thread that runs jobs as
//! they arrive ([`ThreadQueue::spawn`]), or it binds the calling thread,
//! which drains it explicitly with [`pump`](ThreadQueue::pump) and
//! [`run_until`](ThreadQueue::run_until), the shape of a UI or game loop.
//!
//! Shutting a queue down first cancels every live coroutine pinned to it
//! with [`CancelKind::Shutdown`](crate::types::CancelKind::Shutdown), so none
//! is left suspended on a thread that will never run it again. The queue
//! then rejects new jobs with `ThreadUnavailable`. Jobs already queued,
//! including those unwinds, still run on a dedicated thread before it exits.

use crate::affinity::{unavailable, Job, PinnedSet, PostTarget, ThreadDescriptor};
use crate::config::HostConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::{debug, error, trace};
use crate::types::{CancelReason, PanicPayload};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

struct QueueInner {
    name: Arc<str>,
    owner: OnceLock<ThreadId>,
    jobs: SegQueue<Job>,
    lock: Mutex<()>,
    available: Condvar,
    closed: AtomicBool,
    executed: AtomicU64,
    pinned: Arc<PinnedSet>,
}

impl QueueInner {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            owner: OnceLock::new(),
            jobs: SegQueue::new(),
            lock: Mutex::new(()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            pinned: Arc::new(PinnedSet::default()),
        }
    }

    fn is_owner(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    fn run_job(&self, job: Job) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            let payload = PanicPayload::from_unwind(payload.as_ref());
            let _ = &payload;
            error!(queue = %self.name, panic = %payload.message(), "queued job panicked");
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn drain(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.jobs.pop() {
            self.run_job(job);
            ran += 1;
        }
        ran
    }

    fn close(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::AcqRel);
        let _guard = self.lock.lock();
        self.available.notify_all();
        was_open
    }

    fn worker_loop(&self) {
        debug!(queue = %self.name, "queue thread started");
        loop {
            self.drain();
            let mut guard = self.lock.lock();
            if self.jobs.is_empty() {
                if self.closed.load(Ordering::Acquire) {
                    break;
                }
                self.available.wait(&mut guard);
            }
        }
        debug!(queue = %self.name, "queue thread exiting");
    }
}

impl PostTarget for QueueInner {
    fn post(&self, job: Job) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(unavailable(&self.name));
        }
        self.jobs.push(job);
        let _guard = self.lock.lock();
        self.available.notify_one();
        Ok(())
    }
}

/// A job queue bound to one thread.
pub struct ThreadQueue {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadQueue {
    /// Spawns a dedicated thread named `name` that runs posted jobs.
    pub fn spawn(name: impl Into<Arc<str>>) -> Result<Self> {
        Self::spawn_inner(name.into(), None)
    }

    /// Spawns a dedicated thread using the configured name and stack size.
    pub fn spawn_with_config(config: &HostConfig) -> Result<Self> {
        let mut config = config.clone();
        config.normalize();
        Self::spawn_inner(config.queue_name.into(), Some(config.thread_stack_size))
    }

    fn spawn_inner(name: Arc<str>, stack_size: Option<usize>) -> Result<Self> {
        let inner = Arc::new(QueueInner::new(Arc::clone(&name)));
        let mut builder = thread::Builder::new().name(name.to_string());
        if let Some(bytes) = stack_size {
            builder = builder.stack_size(bytes);
        }
        let worker = {
            let inner = Arc::clone(&inner);
            builder.spawn(move || inner.worker_loop()).map_err(|e| {
                Error::new(ErrorKind::ThreadUnavailable)
                    .with_message(format!("failed to spawn queue thread {name}"))
                    .with_source(e)
            })?
        };
        let _ = inner.owner.set(worker.thread().id());
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Binds a queue to the calling thread, which must drain it.
    #[must_use]
    pub fn for_current_thread(name: impl Into<Arc<str>>) -> Self {
        let inner = Arc::new(QueueInner::new(name.into()));
        let _ = inner.owner.set(thread::current().id());
        Self {
            inner,
            worker: Mutex::new(None),
        }
    }

    /// The queue's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Describes the queue's thread, for pinning coroutines to it.
    #[must_use]
    pub fn descriptor(&self) -> ThreadDescriptor {
        let id = self
            .inner
            .owner
            .get()
            .copied()
            .unwrap_or_else(|| thread::current().id());
        let target: Arc<dyn PostTarget> = Arc::clone(&self.inner) as Arc<dyn PostTarget>;
        ThreadDescriptor::with_pinned(
            id,
            Arc::clone(&self.inner.name),
            target,
            Arc::clone(&self.inner.pinned),
        )
    }

    /// Enqueues `job` to run on the queue's thread.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.inner.post(Box::new(job))
    }

    /// Number of jobs waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Number of jobs run so far.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Number of live coroutines pinned to this queue's thread.
    #[must_use]
    pub fn pinned_coroutines(&self) -> usize {
        self.inner.pinned.len()
    }

    /// Returns true once the queue stopped accepting jobs.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_owner(&self, op: &str) -> Result<()> {
        if self.inner.is_owner() {
            Ok(())
        } else {
            Err(Error::invalid_operation(format!(
                "{op} called off the thread of queue {}",
                self.inner.name
            )))
        }
    }

    /// Runs every queued job, including jobs posted meanwhile. Returns how
    /// many ran.
    pub fn pump(&self) -> Result<usize> {
        self.check_owner("pump")?;
        let ran = self.inner.drain();
        if ran > 0 {
            trace!(queue = %self.inner.name, ran, "pumped queue");
        }
        Ok(ran)
    }

    /// Drains the queue until `done` holds or `timeout` elapses. Returns
    /// whether `done` held.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> Result<bool> {
        self.check_owner("run_until")?;
        let deadline = Instant::now() + timeout;
        loop {
            self.inner.drain();
            if done() {
                return Ok(true);
            }
            let mut guard = self.inner.lock.lock();
            if self.inner.jobs.is_empty() {
                if self.inner.closed.load(Ordering::Acquire) {
                    drop(guard);
                    return Ok(done());
                }
                if self
                    .inner
                    .available
                    .wait_until(&mut guard, deadline)
                    .timed_out()
                {
                    drop(guard);
                    self.inner.drain();
                    return Ok(done());
                }
            }
        }
    }

    /// Cancels the coroutines pinned here, then stops accepting jobs. A
    /// dedicated thread finishes the queued jobs and is joined, unless this
    /// is called from that thread.
    ///
    /// On a current-thread queue, call this from the owning thread: the
    /// cancelled coroutines unwind inline. From any other thread their
    /// unwinds are posted to a queue nobody drains anymore.
    pub fn shutdown(&self) {
        if !self.is_shutdown() {
            self.inner.pinned.cancel_all(&CancelReason::shutdown());
        }
        if self.inner.close() {
            debug!(queue = %self.inner.name, "queue shut down");
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!(queue = %self.inner.name, "queue thread panicked");
            }
        }
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadQueue")
            .field("name", &self.inner.name)
            .field("pending", &self.inner.jobs.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
