//! Per-coroutine shared state and the thread-local "current coroutine".
//!
//! While a coroutine body is being polled, its [`CoroutineShared`] is
//! installed in a thread-local so that awaits inside the body can find the
//! pending-await slot, the cancellation token and the epoch without the call
//! site passing anything. Resumptions may nest (a body that completes a
//! promise can run another coroutine inline), so entering saves and restores
//! the previous value.

use crate::affinity::Affinity;
use crate::cancel::CancelToken;
use crate::coordinator::pending::PendingAwait;
use crate::tracing_compat::{debug, trace};
use crate::types::{CancelReason, CoroutineId};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<Arc<CoroutineShared>>> = const { RefCell::new(None) };
}

/// Type-erased state of one coroutine, shared by its driver, its awaits and
/// whoever requests cancellation.
pub(crate) struct CoroutineShared {
    pub(crate) id: CoroutineId,
    pub(crate) name: Option<Arc<str>>,
    pub(crate) token: CancelToken,
    pub(crate) affinity: Affinity,
    /// Bumped at every suspension and at completion. Bounds lease windows.
    pub(crate) epoch: Arc<AtomicU64>,
    /// The single pending await, if suspended on one.
    pending: Mutex<Option<Arc<PendingAwait>>>,
    /// Set once cancellation won; the driver drops the body instead of polling.
    unwind: AtomicBool,
    /// Open non-cancelable scopes.
    deferrals: AtomicUsize,
    pub(crate) suspensions: AtomicU64,
    pub(crate) fast_paths: AtomicU64,
    pub(crate) resumptions: AtomicU64,
}

impl CoroutineShared {
    pub(crate) fn new(name: Option<Arc<str>>, affinity: Affinity) -> Self {
        Self {
            id: CoroutineId::next(),
            name,
            token: CancelToken::new(),
            affinity,
            epoch: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(None),
            unwind: AtomicBool::new(false),
            deferrals: AtomicUsize::new(0),
            suspensions: AtomicU64::new(0),
            fast_paths: AtomicU64::new(0),
            resumptions: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_unwinding(&self) -> bool {
        self.unwind.load(Ordering::Acquire)
    }

    fn is_deferred(&self) -> bool {
        self.deferrals.load(Ordering::Acquire) > 0
    }

    /// Publishes `pending` as this coroutine's only pending await.
    ///
    /// Returns false if another await is already pending.
    pub(crate) fn publish(&self, pending: &Arc<PendingAwait>) -> bool {
        let mut slot = self.pending.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::clone(pending));
        true
    }

    /// Clears the slot if it still holds `pending`.
    pub(crate) fn clear(&self, pending: &Arc<PendingAwait>) {
        let mut slot = self.pending.lock();
        if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, pending)) {
            *slot = None;
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Consumes a recorded cancellation at an await point.
    ///
    /// Returns true if the coroutine must unwind instead of awaiting.
    pub(crate) fn take_cancel_at_await(&self) -> bool {
        if self.is_deferred() || !self.token.is_requested() {
            return false;
        }
        if self.token.consume().is_some() {
            debug!(coroutine = %self.id, "cancellation consumed at await point");
            self.unwind.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Records a cancellation request and, if the coroutine is suspended on
    /// a pending await, races natural completion for it.
    ///
    /// Returns true for the first request.
    pub(crate) fn request_cancel(&self, reason: &CancelReason) -> bool {
        let first = self.token.request(reason);
        debug!(coroutine = %self.id, reason = %reason, first, "cancellation requested");
        let pending = {
            let slot = self.pending.lock();
            if self.is_deferred() {
                trace!(coroutine = %self.id, "cancellation deferred by non-cancelable scope");
                return first;
            }
            slot.clone()
        };
        if let Some(pending) = pending {
            self.cancel_pending(&pending);
        }
        first
    }

    /// Tries to win `pending` for cancellation.
    ///
    /// The winner unregisters on the calling thread, consumes the token and
    /// wakes the coroutine so that it unwinds.
    pub(crate) fn cancel_pending(&self, pending: &Arc<PendingAwait>) -> bool {
        if !pending.try_cancel() {
            trace!(coroutine = %self.id, "cancellation lost to natural completion");
            return false;
        }
        pending.unregister_now();
        self.token.consume();
        self.unwind.store(true, Ordering::Release);
        self.clear(pending);
        debug!(coroutine = %self.id, kind = ?pending.kind(), "cancellation won; unwinding");
        pending.wake_for_unwind();
        true
    }

    /// Settles a request that arrived while `pending` was being published.
    pub(crate) fn take_cancel_race(&self, pending: &Arc<PendingAwait>) -> bool {
        !self.is_deferred() && self.cancel_pending(pending)
    }

    /// Opens a non-cancelable scope.
    pub(crate) fn defer_cancellation(&self) {
        let _slot = self.pending.lock();
        self.deferrals.fetch_add(1, Ordering::AcqRel);
    }

    /// Closes a non-cancelable scope.
    pub(crate) fn resume_cancellation(&self) {
        let _slot = self.pending.lock();
        self.deferrals.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Restores the previously current coroutine on drop.
pub(crate) struct EnterGuard {
    previous: Option<Arc<CoroutineShared>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Makes `shared` the current coroutine until the guard drops.
pub(crate) fn enter(shared: Arc<CoroutineShared>) -> EnterGuard {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(shared));
    EnterGuard { previous }
}

/// Returns the coroutine being polled on this thread.
pub(crate) fn current() -> Option<Arc<CoroutineShared>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Returns the epoch counter of the coroutine being polled on this thread.
pub(crate) fn current_epoch() -> Option<Arc<AtomicU64>> {
    CURRENT.with(|current| current.borrow().as_ref().map(|c| Arc::clone(&c.epoch)))
}
