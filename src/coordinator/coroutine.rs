//! Coroutine handle and driver.
//!
//! A coroutine is a boxed `Future` polled by its own waker. Each poll is one
//! resumption; each `Poll::Pending` is one suspension. The scheduling state
//! serializes resumptions so that a body never runs on two threads at once:
//!
//! ```text
//!   IDLE --wake--> RUNNING --Pending--> IDLE
//!                   |   ^
//!             wake  v   | re-poll
//!                 NOTIFIED
//!   RUNNING --Ready/panic/unwind--> COMPLETED
//! ```
//!
//! A wake that claims `IDLE -> RUNNING` dispatches the run through the
//! coroutine's [`Affinity`]: inline when the current thread is acceptable,
//! posted to the pinned thread otherwise.

use crate::affinity::{Affinity, ThreadDescriptor};
use crate::cancel::CancelToken;
use crate::coordinator::context::{self, CoroutineShared};
use crate::coordinator::Continuation;
use crate::error::{Error, Result};
use crate::tracing_compat::{debug, error, trace};
use crate::transfer::Delivered;
use crate::types::{CancelReason, CoroutineId, Outcome, PanicPayload};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

type Body<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const COMPLETED: u8 = 3;

/// Result storage of a coroutine.
enum Slot<T> {
    Running,
    Ready(T),
    /// The value was moved out by an owning await or `take_outcome`.
    Moved,
    Cancelled(CancelReason),
    Panicked(PanicPayload),
}

impl<T> Slot<T> {
    const fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ready(_) => "ok",
            Self::Moved => "moved",
            Self::Cancelled(_) => "cancelled",
            Self::Panicked(_) => "panicked",
        }
    }
}

pub(crate) struct CoroutineCore<T> {
    shared: Arc<CoroutineShared>,
    sched: AtomicU8,
    polls: AtomicU64,
    body: Mutex<Option<Body<T>>>,
    result: Mutex<Slot<T>>,
    done: Condvar,
    /// Continuations of coroutines awaiting this one; `None` once completed.
    waiters: Mutex<Option<HashMap<u64, Continuation>>>,
    next_waiter: AtomicU64,
}

impl<T: Send + 'static> CoroutineCore<T> {
    fn schedule(self: &Arc<Self>) {
        let mut state = self.sched.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => RUNNING,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self
                .sched
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        if state == RUNNING {
            trace!(coroutine = %self.shared.id, "woken while running; re-poll scheduled");
            return;
        }
        let core = Arc::clone(self);
        if let Err(e) = self.shared.affinity.dispatch(Box::new(move || core.run())) {
            let _ = &e;
            error!(coroutine = %self.shared.id, error = %e, "resumption could not be dispatched");
            self.sched.store(IDLE, Ordering::Release);
        }
    }

    fn run(self: &Arc<Self>) {
        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        loop {
            if self.shared.is_unwinding() {
                let reason = self.shared.token.reason().unwrap_or_default();
                self.finish(Slot::Cancelled(reason));
                return;
            }
            if self.polls.fetch_add(1, Ordering::Relaxed) > 0 {
                self.shared.resumptions.fetch_add(1, Ordering::Relaxed);
            }
            let polled = {
                let mut body = self.body.lock();
                let Some(fut) = body.as_mut() else {
                    return;
                };
                let _enter = context::enter(Arc::clone(&self.shared));
                catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)))
            };
            match polled {
                Ok(Poll::Ready(value)) => {
                    self.finish(Slot::Ready(value));
                    return;
                }
                Err(payload) => {
                    let payload = PanicPayload::from_unwind(payload.as_ref());
                    error!(coroutine = %self.shared.id, panic = %payload, "coroutine body panicked");
                    self.finish(Slot::Panicked(payload));
                    return;
                }
                Ok(Poll::Pending) => {
                    if self.shared.is_unwinding() {
                        continue;
                    }
                    self.shared.epoch.fetch_add(1, Ordering::AcqRel);
                    self.shared.suspensions.fetch_add(1, Ordering::Relaxed);
                    if self
                        .sched
                        .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    self.sched.store(RUNNING, Ordering::Release);
                }
            }
        }
    }

    fn finish(&self, slot: Slot<T>) {
        let body = self.body.lock().take();
        drop(body);
        {
            let mut result = self.result.lock();
            *result = slot;
            self.done.notify_all();
        }
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.sched.store(COMPLETED, Ordering::Release);
        if let Some(thread) = self.shared.affinity.pinned_thread() {
            thread.pinned().remove(self.shared.id);
        }
        let waiters = self.waiters.lock().take().unwrap_or_default();
        debug!(
            coroutine = %self.shared.id,
            outcome = self.result.lock().label(),
            waiters = waiters.len(),
            "coroutine completed"
        );
        for (_, waiter) in waiters {
            waiter.resume();
        }
    }
}

impl<T: Send + 'static> Wake for CoroutineCore<T> {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

/// Configures a coroutine before it starts.
#[derive(Debug, Default)]
pub struct CoroutineBuilder {
    name: Option<Arc<str>>,
    affinity: Affinity,
}

impl CoroutineBuilder {
    /// Names the coroutine for diagnostics.
    #[must_use]
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pins the coroutine to `thread`.
    #[must_use]
    pub fn pinned_to(mut self, thread: &ThreadDescriptor) -> Self {
        self.affinity = Affinity::Pinned(thread.clone());
        self
    }

    /// Sets the affinity directly.
    #[must_use]
    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    /// Starts `body`.
    ///
    /// An unrestricted coroutine, or a pinned one started on its own thread,
    /// runs inline until its first suspension. A pinned coroutine started
    /// elsewhere is posted to its thread.
    pub fn spawn<F>(self, body: F) -> Coroutine<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shared = Arc::new(CoroutineShared::new(self.name, self.affinity));
        if let Some(thread) = shared.affinity.pinned_thread() {
            thread.pinned().insert(&shared);
        }
        let core = Arc::new(CoroutineCore {
            shared,
            sched: AtomicU8::new(IDLE),
            polls: AtomicU64::new(0),
            body: Mutex::new(Some(Box::pin(body))),
            result: Mutex::new(Slot::Running),
            done: Condvar::new(),
            waiters: Mutex::new(Some(HashMap::new())),
            next_waiter: AtomicU64::new(0),
        });
        debug!(
            coroutine = %core.shared.id,
            pinned = core.shared.affinity.pinned_thread().map(ThreadDescriptor::name),
            "coroutine spawned"
        );
        core.schedule();
        Coroutine { core }
    }
}

/// Handle to a running or completed coroutine.
///
/// Clones share one coroutine and one result slot. Awaiting a handle by
/// value moves the result out; awaiting it by reference copies it.
pub struct Coroutine<T> {
    core: Arc<CoroutineCore<T>>,
}

impl<T> Clone for Coroutine<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl Coroutine<()> {
    /// Returns a builder for a named or pinned coroutine.
    #[must_use]
    pub fn builder() -> CoroutineBuilder {
        CoroutineBuilder::default()
    }
}

impl<T: Send + 'static> Coroutine<T> {
    /// Starts an unrestricted coroutine, running it inline until it first
    /// suspends.
    pub fn spawn<F>(body: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        CoroutineBuilder::default().spawn(body)
    }

    /// Starts a coroutine pinned to `thread`.
    pub fn spawn_pinned<F>(thread: &ThreadDescriptor, body: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        CoroutineBuilder::default().pinned_to(thread).spawn(body)
    }

    /// Requests cancellation with a default user reason.
    pub fn cancel(&self) -> bool {
        self.cancel_with(&CancelReason::default())
    }

    /// Requests cancellation. Safe from any thread.
    ///
    /// If the coroutine is suspended on an await, this races the source:
    /// a winning request unregisters on the calling thread and unwinds the
    /// coroutine. Otherwise the request is consumed at the next await.
    /// Returns true for the first request.
    pub fn cancel_with(&self, reason: &CancelReason) -> bool {
        self.core.shared.request_cancel(reason)
    }

    /// Moves the outcome out, if the coroutine finished.
    ///
    /// Returns `None` while running and after the value has been moved.
    pub fn take_outcome(&self) -> Option<Outcome<T>> {
        let mut result = self.core.result.lock();
        match &*result {
            Slot::Running | Slot::Moved => None,
            Slot::Cancelled(reason) => Some(Outcome::Cancelled(reason.clone())),
            Slot::Panicked(payload) => Some(Outcome::Panicked(payload.clone())),
            Slot::Ready(_) => match std::mem::replace(&mut *result, Slot::Moved) {
                Slot::Ready(value) => Some(Outcome::Ok(value)),
                _ => None,
            },
        }
    }

    /// Blocks until the coroutine finishes and moves its result out.
    ///
    /// Must not be called on the thread a pinned coroutine needs.
    pub fn join(&self) -> Result<T> {
        self.wait();
        self.take_outcome().map_or_else(
            || {
                Err(Error::invalid_operation("coroutine result already moved")
                    .with_coroutine(self.id()))
            },
            Outcome::into_result,
        )
    }

    pub(crate) fn take_moved(&self) -> Option<Result<T>> {
        let mut result = self.core.result.lock();
        let id = self.id();
        match &*result {
            Slot::Running => None,
            Slot::Moved => Some(Err(Error::invalid_operation(
                "coroutine result already moved",
            )
            .with_coroutine(id))),
            Slot::Cancelled(reason) => Some(Err(Error::cancelled(reason).with_coroutine(id))),
            Slot::Panicked(payload) => Some(Err(Error::panicked(payload).with_coroutine(id))),
            Slot::Ready(_) => match std::mem::replace(&mut *result, Slot::Moved) {
                Slot::Ready(value) => Some(Delivered::moved(value).into_value()),
                _ => None,
            },
        }
    }

    pub(crate) fn take_copied(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        let result = self.core.result.lock();
        let id = self.id();
        match &*result {
            Slot::Running => None,
            Slot::Moved => Some(Err(Error::invalid_operation(
                "coroutine result already moved",
            )
            .with_coroutine(id))),
            Slot::Cancelled(reason) => Some(Err(Error::cancelled(reason).with_coroutine(id))),
            Slot::Panicked(payload) => Some(Err(Error::panicked(payload).with_coroutine(id))),
            Slot::Ready(value) => Some(Delivered::copied(value).into_value()),
        }
    }

    /// Adds a continuation fired on completion.
    ///
    /// Hands the continuation back if the coroutine already completed.
    pub(crate) fn add_waiter(
        &self,
        continuation: Continuation,
    ) -> std::result::Result<WaiterRegistration<T>, Continuation> {
        let mut waiters = self.core.waiters.lock();
        let Some(map) = waiters.as_mut() else {
            return Err(continuation);
        };
        let key = self.core.next_waiter.fetch_add(1, Ordering::Relaxed);
        map.insert(key, continuation);
        Ok(WaiterRegistration {
            core: Arc::downgrade(&self.core),
            key,
        })
    }
}

impl<T> Coroutine<T> {
    /// The coroutine's identifier.
    #[must_use]
    pub fn id(&self) -> CoroutineId {
        self.core.shared.id
    }

    /// The coroutine's name, if it was given one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.core.shared.name.as_deref()
    }

    /// Where the coroutine may resume.
    #[must_use]
    pub fn affinity(&self) -> &Affinity {
        &self.core.shared.affinity
    }

    /// The coroutine's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.core.shared.token
    }

    /// Returns true once the body finished, by value, cancellation or panic.
    #[must_use]
    pub fn is_done(&self) -> bool {
        !matches!(*self.core.result.lock(), Slot::Running)
    }

    /// Returns true if the coroutine finished by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.core.result.lock(), Slot::Cancelled(_))
    }

    /// Returns true if the coroutine finished by panicking.
    #[must_use]
    pub fn is_panicked(&self) -> bool {
        matches!(*self.core.result.lock(), Slot::Panicked(_))
    }

    /// Returns true if the result was moved out.
    #[must_use]
    pub fn is_moved(&self) -> bool {
        matches!(*self.core.result.lock(), Slot::Moved)
    }

    /// Copies the outcome, if the coroutine finished and the value was not
    /// moved out.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome<T>>
    where
        T: Clone,
    {
        match &*self.core.result.lock() {
            Slot::Running | Slot::Moved => None,
            Slot::Ready(value) => Some(Outcome::Ok(value.clone())),
            Slot::Cancelled(reason) => Some(Outcome::Cancelled(reason.clone())),
            Slot::Panicked(payload) => Some(Outcome::Panicked(payload.clone())),
        }
    }

    /// Blocks the calling thread until the coroutine finishes.
    ///
    /// Must not be called on the thread a pinned coroutine needs.
    pub fn wait(&self) {
        let mut result = self.core.result.lock();
        while matches!(*result, Slot::Running) {
            self.core.done.wait(&mut result);
        }
    }

    /// Like [`wait`](Self::wait) with a deadline. Returns true if finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut result = self.core.result.lock();
        while matches!(*result, Slot::Running) {
            if self.core.done.wait_until(&mut result, deadline).timed_out() {
                return !matches!(*result, Slot::Running);
            }
        }
        true
    }

    /// Number of times the body suspended.
    #[must_use]
    pub fn suspensions(&self) -> u64 {
        self.core.shared.suspensions.load(Ordering::Relaxed)
    }

    /// Number of awaits satisfied without suspending.
    #[must_use]
    pub fn fast_paths(&self) -> u64 {
        self.core.shared.fast_paths.load(Ordering::Relaxed)
    }

    /// Number of times the body was polled again after the first poll.
    #[must_use]
    pub fn resumptions(&self) -> u64 {
        self.core.shared.resumptions.load(Ordering::Relaxed)
    }
}

impl<T> fmt::Debug for Coroutine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.core.shared.id)
            .field("name", &self.core.shared.name)
            .field("state", &self.core.result.lock().label())
            .finish_non_exhaustive()
    }
}

/// Registration of an awaiting coroutine on its target.
pub(crate) struct WaiterRegistration<T> {
    core: Weak<CoroutineCore<T>>,
    key: u64,
}

impl<T: Send + 'static> crate::source::Registration for WaiterRegistration<T> {
    fn unregister(self: Box<Self>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let removed = core
            .waiters
            .lock()
            .as_mut()
            .and_then(|map| map.remove(&self.key));
        drop(removed);
    }
}
