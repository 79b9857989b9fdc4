//! Tasks with a retained, repeatedly queryable result.

use crate::coordinator::Continuation;
use crate::error::{Error, Result};
use crate::source::Registration;
use crate::transfer::{Delivered, Lease};
use crate::tracing_compat::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

struct TaskState<T> {
    result: Option<Result<Arc<T>>>,
    waiters: HashMap<u64, Continuation>,
    next_waiter: u64,
}

struct TaskInner<T> {
    state: Mutex<TaskState<T>>,
    done: Condvar,
}

/// A scheduled unit of work whose result stays available after completion.
///
/// Any number of clones may await or query the task; none of them takes the
/// result. Awaiting yields a [`Lease`] into the retained storage.
pub struct Task<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Task<T> {
    fn with_result(result: Option<Result<Arc<T>>>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                state: Mutex::new(TaskState {
                    result,
                    waiters: HashMap::new(),
                    next_waiter: 0,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// A task that already completed with `value`.
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self::with_result(Some(Ok(Arc::new(value))))
    }

    /// An incomplete task and the handle that completes it.
    #[must_use]
    pub fn pending() -> (TaskCompleter<T>, Self) {
        let task = Self::with_result(None);
        (
            TaskCompleter {
                task: task.clone(),
                completed: false,
            },
            task,
        )
    }

    /// Returns true once the task finished, successfully or not.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().result.is_some()
    }

    /// Number of coroutines currently suspended on the task.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Polls the retained result without blocking.
    pub fn try_get(&self) -> Option<Result<Lease<T>>>
    where
        T: 'static,
    {
        let result = self.inner.state.lock().result.clone()?;
        Some(result.and_then(|storage| Delivered::leased(storage).into_lease()))
    }

    /// Blocks until the task completes. Not for use inside coroutines.
    pub fn wait(&self) -> Result<Lease<T>>
    where
        T: 'static,
    {
        let mut state = self.inner.state.lock();
        while state.result.is_none() {
            self.inner.done.wait(&mut state);
        }
        drop(state);
        self.try_get()
            .unwrap_or_else(|| Err(Error::internal("task result vanished")))
    }

    /// Blocks until the task completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Lease<T>>>
    where
        T: 'static,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.result.is_none() {
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        drop(state);
        self.try_get()
    }

    /// Parks `continuation` until completion; hands it back if already done.
    pub(crate) fn park(
        &self,
        continuation: Continuation,
    ) -> std::result::Result<TaskRegistration<T>, Continuation> {
        let mut state = self.inner.state.lock();
        if state.result.is_some() {
            return Err(continuation);
        }
        let key = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.insert(key, continuation);
        Ok(TaskRegistration {
            inner: Arc::downgrade(&self.inner),
            key,
        })
    }

    fn complete_with(&self, result: Result<Arc<T>>) {
        let waiters = {
            let mut state = self.inner.state.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            self.inner.done.notify_all();
            std::mem::take(&mut state.waiters)
        };
        trace!(waiters = waiters.len(), "task completed");
        for (_, waiter) in waiters {
            waiter.resume();
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Task")
            .field("complete", &state.result.is_some())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Completes a [`Task`]. Dropping it without completing fails the task.
pub struct TaskCompleter<T> {
    task: Task<T>,
    completed: bool,
}

impl<T> TaskCompleter<T> {
    /// Stores the result and resumes every waiting coroutine on this thread.
    pub fn complete(mut self, value: T) {
        self.completed = true;
        self.task.complete_with(Ok(Arc::new(value)));
    }

    /// Fails the task.
    pub fn fail(mut self, error: Error) {
        self.completed = true;
        self.task.complete_with(Err(error));
    }
}

impl<T> Drop for TaskCompleter<T> {
    fn drop(&mut self) {
        if !self.completed {
            self.task
                .complete_with(Err(Error::abandoned("task completer dropped")));
        }
    }
}

impl<T> fmt::Debug for TaskCompleter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCompleter")
            .field("completed", &self.completed)
            .finish()
    }
}

pub(crate) struct TaskRegistration<T> {
    inner: Weak<TaskInner<T>>,
    key: u64,
}

impl<T: Send + Sync + 'static> Registration for TaskRegistration<T> {
    fn unregister(self: Box<Self>) {
        if let Some(inner) = self.inner.upgrade() {
            let waiter = inner.state.lock().waiters.remove(&self.key);
            drop(waiter);
        }
    }
}
