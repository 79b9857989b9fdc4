//! Moving a coroutine onto another thread.
//!
//! `thread.switch_to().await` resumes the awaiting coroutine on the described
//! thread; `pool.switch_to().await` resumes it on one of the pool's workers.
//! Already being there takes the fast path. The switch only changes where an
//! unrestricted coroutine continues: a pinned coroutine is always delivered
//! back to its pin.

use crate::affinity::ThreadDescriptor;
use crate::coordinator::{Continuation, Suspension};
use crate::error::Result;
use crate::host::pool::PoolInner;
use crate::host::WorkerPool;
use crate::source::{AwaitableSource, Registration, SourceKind};
use crate::tracing_compat::trace;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
enum Destination {
    Thread(ThreadDescriptor),
    Pool(Arc<PoolInner>),
}

impl Destination {
    fn is_current(&self) -> bool {
        match self {
            Self::Thread(thread) => thread.is_current(),
            Self::Pool(pool) => pool.is_current(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Thread(thread) => thread.name(),
            Self::Pool(pool) => pool.name(),
        }
    }
}

/// Awaitable that moves the coroutine to a thread or pool.
#[must_use = "a thread switch does nothing unless awaited"]
pub struct ThreadSwitch {
    destination: Destination,
}

impl fmt::Debug for ThreadSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSwitch")
            .field("destination", &self.destination.name())
            .finish()
    }
}

impl ThreadDescriptor {
    /// Awaitable that continues the current coroutine on this thread.
    pub fn switch_to(&self) -> Suspension<ThreadSwitch> {
        Suspension::new(ThreadSwitch {
            destination: Destination::Thread(self.clone()),
        })
    }
}

impl WorkerPool {
    /// Awaitable that continues the current coroutine on a pool worker.
    pub fn switch_to(&self) -> Suspension<ThreadSwitch> {
        Suspension::new(ThreadSwitch {
            destination: Destination::Pool(self.shared()),
        })
    }
}

struct Hop {
    continuation: Arc<Mutex<Option<Continuation>>>,
}

impl Registration for Hop {
    fn unregister(self: Box<Self>) {
        let continuation = self.continuation.lock().take();
        drop(continuation);
    }
}

impl AwaitableSource for ThreadSwitch {
    type Output = ();

    fn kind(&self) -> SourceKind {
        SourceKind::ThreadSwitch
    }

    fn is_ready(&self) -> bool {
        self.destination.is_current()
    }

    fn try_take_fast_path(&mut self) -> Option<Result<()>> {
        self.destination.is_current().then_some(Ok(()))
    }

    fn register(&mut self, continuation: Continuation) -> Result<Box<dyn Registration>> {
        let slot = Arc::new(Mutex::new(Some(continuation)));
        let job = {
            let slot = Arc::clone(&slot);
            Box::new(move || {
                let continuation = slot.lock().take();
                if let Some(continuation) = continuation {
                    continuation.resume();
                }
            })
        };
        trace!(destination = self.destination.name(), "switching threads");
        match &self.destination {
            Destination::Thread(thread) => thread.post(job)?,
            Destination::Pool(pool) => pool.post(job)?,
        }
        Ok(Box::new(Hop { continuation: slot }))
    }

    fn take_resolved(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume_thread_requirement(&self) -> Option<ThreadDescriptor> {
        match &self.destination {
            Destination::Thread(thread) => Some(thread.clone()),
            Destination::Pool(_) => None,
        }
    }
}
