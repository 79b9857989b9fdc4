//! TaskAdapter: awaiting schedulable work with a retained result.
//!
//! The task keeps ownership of its result, so the coroutine receives a
//! [`Lease`] rather than a value. If the task is still running, the
//! coroutine's continuation is handed to the task and resumes on whichever
//! thread completes it; for worker-pool tasks that is a pool worker, an
//! intended migration.

use crate::coordinator::{Continuation, Suspension};
use crate::error::{Error, Result};
use crate::host::Task;
use crate::source::{AwaitableSource, Redeemed, Registration, SourceKind};
use crate::transfer::{Lease, Transfer};
use std::future::IntoFuture;

/// Adapter over a [`Task`] handle.
#[derive(Debug)]
pub struct TaskSource<T> {
    task: Task<T>,
}

impl<T> TaskSource<T> {
    /// Wraps a task handle.
    pub fn new(task: Task<T>) -> Self {
        Self { task }
    }
}

impl<T: Send + Sync + 'static> AwaitableSource for TaskSource<T> {
    type Output = Lease<T>;

    fn kind(&self) -> SourceKind {
        SourceKind::Task
    }

    fn is_ready(&self) -> bool {
        self.task.is_complete()
    }

    fn transfer(&self) -> Option<Transfer> {
        Some(Transfer::select(true, true))
    }

    fn try_take_fast_path(&mut self) -> Option<Result<Lease<T>>> {
        self.task.try_get()
    }

    fn register(&mut self, continuation: Continuation) -> Result<Box<dyn Registration>> {
        match self.task.park(continuation) {
            Ok(registration) => Ok(Box::new(registration)),
            Err(continuation) => {
                continuation.resume();
                Ok(Box::new(Redeemed))
            }
        }
    }

    fn take_resolved(&mut self) -> Result<Lease<T>> {
        self.task
            .try_get()
            .unwrap_or_else(|| Err(Error::internal("task resumed before completing")))
    }
}

impl<T: Send + Sync + 'static> IntoFuture for Task<T> {
    type Output = Result<Lease<T>>;
    type IntoFuture = Suspension<TaskSource<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(TaskSource::new(self))
    }
}

impl<T: Send + Sync + 'static> IntoFuture for &Task<T> {
    type Output = Result<Lease<T>>;
    type IntoFuture = Suspension<TaskSource<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(TaskSource::new(self.clone()))
    }
}
