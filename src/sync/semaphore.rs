//! An awaitable counting semaphore.
//!
//! Awaiting `&semaphore` acquires one count and yields a [`SemaphorePermit`]
//! that gives it back on drop. A count handed to a suspended awaiter is
//! reserved for it before the awaiter resumes, so a woken coroutine never
//! has to compete for it again. If that awaiter lost to cancellation in the
//! meantime the count goes back and the next waiter is tried.

use crate::coordinator::{Continuation, Suspension};
use crate::error::{Error, Result};
use crate::source::{AwaitableSource, Redeemed, Registration, SourceKind};
use crate::tracing_compat::{error, trace};
use crate::transfer::Transfer;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Weak};

struct SemState {
    count: usize,
    waiters: VecDeque<(u64, Continuation)>,
    next_waiter: u64,
}

struct SemInner {
    capacity: usize,
    state: Mutex<SemState>,
}

impl SemInner {
    /// Hands available counts to waiters, most recent first.
    fn resume_waiters<'a>(&'a self, mut state: MutexGuard<'a, SemState>) {
        while state.count > 0 {
            let Some((_, waiter)) = state.waiters.pop_front() else {
                break;
            };
            state.count -= 1;
            drop(state);
            let resumed = waiter.resume();
            state = self.state.lock();
            if !resumed {
                trace!("semaphore waiter lost to cancellation; count returned");
                state.count += 1;
            }
        }
    }

    fn release(&self, n: usize) {
        let mut state = self.state.lock();
        let count = state.count + n;
        if count > self.capacity {
            error!(count, capacity = self.capacity, "permit released above capacity; clamped");
        }
        state.count = count.min(self.capacity);
        self.resume_waiters(state);
    }
}

/// Counting semaphore that coroutines await with `(&semaphore).await`.
///
/// Clones share the semaphore.
#[derive(Clone)]
pub struct AwaitableSemaphore {
    inner: Arc<SemInner>,
}

impl AwaitableSemaphore {
    /// Creates a semaphore holding `initial` of `capacity` counts.
    ///
    /// Fails with `InvalidOperation` if `capacity` is zero or `initial`
    /// exceeds it.
    pub fn new(capacity: usize, initial: usize) -> Result<Self> {
        if capacity == 0 || initial > capacity {
            return Err(Error::invalid_operation(format!(
                "semaphore values out of range: capacity {capacity}, initial {initial}"
            )));
        }
        Ok(Self {
            inner: Arc::new(SemInner {
                capacity,
                state: Mutex::new(SemState {
                    count: initial,
                    waiters: VecDeque::new(),
                    next_waiter: 0,
                }),
            }),
        })
    }

    /// Adds `n` counts, resuming waiters on this thread.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero or the count would exceed the capacity.
    pub fn unlock(&self, n: usize) {
        assert!(n > 0, "semaphore unlocked by zero");
        let mut state = self.inner.state.lock();
        let count = state.count + n;
        if count > self.inner.capacity {
            drop(state);
            panic!(
                "semaphore unlocked above maximum: {count} > {}",
                self.inner.capacity
            );
        }
        state.count = count;
        self.inner.resume_waiters(state);
    }

    /// Takes a count without waiting, if one is available.
    #[must_use]
    pub fn try_acquire(&self) -> Option<SemaphorePermit> {
        let mut state = self.inner.state.lock();
        if state.count == 0 {
            return None;
        }
        state.count -= 1;
        Some(self.permit())
    }

    /// Counts currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.state.lock().count
    }

    /// Maximum count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of coroutines suspended on the semaphore.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    fn permit(&self) -> SemaphorePermit {
        SemaphorePermit {
            semaphore: Some(Arc::clone(&self.inner)),
        }
    }
}

impl fmt::Debug for AwaitableSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AwaitableSemaphore")
            .field("capacity", &self.inner.capacity)
            .field("count", &state.count)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// One acquired count. Returned to the semaphore on drop.
#[must_use = "dropping a permit releases it immediately"]
pub struct SemaphorePermit {
    semaphore: Option<Arc<SemInner>>,
}

impl SemaphorePermit {
    /// Keeps the count taken; the semaphore does not get it back.
    pub fn forget(mut self) {
        self.semaphore = None;
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        if let Some(semaphore) = self.semaphore.take() {
            semaphore.release(1);
        }
    }
}

impl fmt::Debug for SemaphorePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphorePermit")
            .field("held", &self.semaphore.is_some())
            .finish()
    }
}

struct SemaphoreRegistration {
    inner: Weak<SemInner>,
    key: u64,
}

impl Registration for SemaphoreRegistration {
    fn unregister(self: Box<Self>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let removed = {
            let mut state = inner.state.lock();
            state
                .waiters
                .iter()
                .position(|(key, _)| *key == self.key)
                .and_then(|index| state.waiters.remove(index))
        };
        drop(removed);
    }
}

/// Adapter over an [`AwaitableSemaphore`].
#[derive(Debug)]
pub struct SemaphoreSource {
    semaphore: AwaitableSemaphore,
}

impl AwaitableSource for SemaphoreSource {
    type Output = SemaphorePermit;

    fn kind(&self) -> SourceKind {
        SourceKind::Semaphore
    }

    fn is_ready(&self) -> bool {
        self.semaphore.available() > 0
    }

    fn transfer(&self) -> Option<Transfer> {
        Some(Transfer::select(true, false))
    }

    fn try_take_fast_path(&mut self) -> Option<Result<SemaphorePermit>> {
        self.semaphore.try_acquire().map(Ok)
    }

    fn register(&mut self, continuation: Continuation) -> Result<Box<dyn Registration>> {
        let mut state = self.semaphore.inner.state.lock();
        if state.count > 0 {
            state.count -= 1;
            drop(state);
            if !continuation.resume() {
                self.semaphore.inner.release(1);
            }
            return Ok(Box::new(Redeemed));
        }
        let key = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push_front((key, continuation));
        Ok(Box::new(SemaphoreRegistration {
            inner: Arc::downgrade(&self.semaphore.inner),
            key,
        }))
    }

    fn take_resolved(&mut self) -> Result<SemaphorePermit> {
        Ok(self.semaphore.permit())
    }
}

impl IntoFuture for &AwaitableSemaphore {
    type Output = Result<SemaphorePermit>;
    type IntoFuture = Suspension<SemaphoreSource>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(SemaphoreSource {
            semaphore: self.clone(),
        })
    }
}
