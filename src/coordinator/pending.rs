//! The pending-await record and the continuation handed to sources.
//!
//! A [`PendingAwait`] exists from the moment a coroutine registers with a
//! source until it is resumed or unwound. Its resolution flag is the single
//! decision point between natural completion and cancellation: both sides
//! race to move it out of `Pending`, and only the winner touches the
//! registration or wakes the coroutine.

use crate::affinity::{dispatch_required, ThreadDescriptor};
use crate::cancel::CancelToken;
use crate::shim::{AtomicU8, Mutex, Ordering};
use crate::source::{Registration, SourceKind};
use crate::tracing_compat::{error, trace, warn};
use crate::types::CoroutineId;
use std::fmt;
use std::sync::Arc;
use std::task::Waker;

const PENDING: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;
const CANCELLED: u8 = 3;
const ABANDONED: u8 = 4;

/// Observable state of a pending await's resolution flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Pending,
    /// Completion won and is stashing the delivered data.
    Resolving,
    Resolved,
    Cancelled,
    /// The source dropped its continuation without resuming it.
    Abandoned,
}

pub(crate) struct PendingAwait {
    state: AtomicU8,
    registration: Mutex<Option<Box<dyn Registration>>>,
    waker: Mutex<Option<Waker>>,
    resume_on: Option<ThreadDescriptor>,
    token: CancelToken,
    kind: SourceKind,
    coroutine: CoroutineId,
}

impl PendingAwait {
    pub(crate) fn new(
        kind: SourceKind,
        coroutine: CoroutineId,
        token: CancelToken,
        resume_on: Option<ThreadDescriptor>,
        waker: Waker,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            registration: Mutex::new(None),
            waker: Mutex::new(Some(waker)),
            resume_on,
            token,
            kind,
            coroutine,
        })
    }

    pub(crate) fn resolution(&self) -> Resolution {
        match self.state.load(Ordering::Acquire) {
            PENDING => Resolution::Pending,
            RESOLVING => Resolution::Resolving,
            RESOLVED => Resolution::Resolved,
            CANCELLED => Resolution::Cancelled,
            _ => Resolution::Abandoned,
        }
    }

    pub(crate) fn kind(&self) -> SourceKind {
        self.kind
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the flag for cancellation.
    pub(crate) fn try_cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    /// Stores the registration token returned by the source.
    ///
    /// If the flag already left `Pending`, the winner has already looked for
    /// the token, so the registering thread redeems it immediately.
    pub(crate) fn install(&self, registration: Box<dyn Registration>) {
        let mut slot = self.registration.lock();
        if self.state.load(Ordering::Acquire) == PENDING {
            *slot = Some(registration);
            return;
        }
        drop(slot);
        trace!(coroutine = %self.coroutine, kind = ?self.kind, "resolved during registration; unregistering");
        registration.unregister();
    }

    /// Redeems the stored registration, if any, on the calling thread.
    pub(crate) fn unregister_now(&self) {
        let registration = self.registration.lock().take();
        if let Some(registration) = registration {
            registration.unregister();
        }
    }

    /// Updates the waker used for resumption.
    pub(crate) fn set_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Wakes the coroutine so that it unwinds; the coroutine's own affinity
    /// decides where.
    pub(crate) fn wake_for_unwind(&self) {
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wakes the coroutine after resolution, honouring the source's resume
    /// thread requirement.
    fn wake_resolved(&self) {
        let Some(waker) = self.waker.lock().take() else {
            return;
        };
        let job = Box::new(move || waker.wake());
        if let Err(e) = dispatch_required(self.resume_on.as_ref(), job) {
            let _ = &e;
            error!(coroutine = %self.coroutine, error = %e, "resumption dropped; coroutine stays suspended");
        }
    }
}

impl fmt::Debug for PendingAwait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAwait")
            .field("coroutine", &self.coroutine)
            .field("kind", &self.kind)
            .field("resolution", &self.resolution())
            .finish_non_exhaustive()
    }
}

/// The callback a source invokes to resume the awaiting coroutine.
///
/// Consumed by [`resume`](Self::resume) or [`resume_with`](Self::resume_with).
/// Dropping it without resuming marks the await abandoned, which resumes the
/// coroutine with `SourceAbandoned`.
pub struct Continuation {
    pending: Arc<PendingAwait>,
    spent: bool,
}

impl Continuation {
    pub(crate) fn new(pending: Arc<PendingAwait>) -> Self {
        Self {
            pending,
            spent: false,
        }
    }

    /// Snapshot of the awaiting coroutine's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.pending.token
    }

    /// The awaiting coroutine.
    #[must_use]
    pub fn coroutine(&self) -> CoroutineId {
        self.pending.coroutine
    }

    /// Returns true while neither completion nor cancellation has claimed
    /// the await.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.pending.resolution() == Resolution::Pending
    }

    /// Resumes the coroutine. Returns false if cancellation got there first.
    pub fn resume(self) -> bool {
        self.resume_with(|| {})
    }

    /// Runs `stash` and resumes the coroutine, if completion wins the race.
    ///
    /// `stash` runs only for the winner and before the coroutine can observe
    /// the resolution, so it is where a source hands over delivered data.
    /// The registration is redeemed on the calling thread before waking.
    pub fn resume_with<F: FnOnce()>(mut self, stash: F) -> bool {
        self.spent = true;
        let pending = &self.pending;
        if !pending.transition(RESOLVING) {
            trace!(coroutine = %pending.coroutine, kind = ?pending.kind, "completion lost to cancellation");
            return false;
        }
        stash();
        pending.state.store(RESOLVED, Ordering::Release);
        pending.unregister_now();
        trace!(coroutine = %pending.coroutine, kind = ?pending.kind, "resuming");
        pending.wake_resolved();
        true
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if self.spent || !self.pending.transition(ABANDONED) {
            return;
        }
        warn!(coroutine = %self.pending.coroutine, kind = ?self.pending.kind, "source dropped a live continuation");
        self.pending.unregister_now();
        self.pending.wake_resolved();
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("pending", &self.pending)
            .field("spent", &self.spent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingRegistration(Arc<AtomicUsize>);

    impl Registration for CountingRegistration {
        fn unregister(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pending_with(wakes: &Arc<CountingWaker>) -> Arc<PendingAwait> {
        PendingAwait::new(
            SourceKind::Future,
            CoroutineId::new_for_test(1),
            CancelToken::new(),
            None,
            Waker::from(Arc::clone(wakes)),
        )
    }

    #[test]
    fn resume_stashes_unregisters_and_wakes() {
        let wakes = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let unregisters = Arc::new(AtomicUsize::new(0));
        let pending = pending_with(&wakes);
        pending.install(Box::new(CountingRegistration(Arc::clone(&unregisters))));

        let stashed = AtomicUsize::new(0);
        let cont = Continuation::new(Arc::clone(&pending));
        assert!(cont.is_live());
        assert!(cont.resume_with(|| {
            stashed.store(10, Ordering::SeqCst);
        }));

        assert_eq!(stashed.load(Ordering::SeqCst), 10);
        assert_eq!(pending.resolution(), Resolution::Resolved);
        assert_eq!(unregisters.load(Ordering::SeqCst), 1);
        assert_eq!(wakes.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resume_after_cancel_is_rejected() {
        let wakes = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let pending = pending_with(&wakes);
        let cont = Continuation::new(Arc::clone(&pending));
        assert!(pending.try_cancel());
        assert!(!cont.resume_with(|| panic!("stash must not run for the loser")));
        assert_eq!(pending.resolution(), Resolution::Cancelled);
        assert_eq!(wakes.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn late_install_unregisters_immediately() {
        let wakes = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let unregisters = Arc::new(AtomicUsize::new(0));
        let pending = pending_with(&wakes);
        assert!(Continuation::new(Arc::clone(&pending)).resume());

        pending.install(Box::new(CountingRegistration(Arc::clone(&unregisters))));
        assert_eq!(unregisters.load(Ordering::SeqCst), 1);
        pending.unregister_now();
        assert_eq!(unregisters.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_continuation_abandons() {
        let wakes = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let unregisters = Arc::new(AtomicUsize::new(0));
        let pending = pending_with(&wakes);
        pending.install(Box::new(CountingRegistration(Arc::clone(&unregisters))));

        drop(Continuation::new(Arc::clone(&pending)));
        assert_eq!(pending.resolution(), Resolution::Abandoned);
        assert_eq!(unregisters.load(Ordering::SeqCst), 1);
        assert_eq!(wakes.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_continuation_after_cancel_is_silent() {
        let wakes = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let pending = pending_with(&wakes);
        let cont = Continuation::new(Arc::clone(&pending));
        assert!(pending.try_cancel());
        drop(cont);
        assert_eq!(pending.resolution(), Resolution::Cancelled);
        assert_eq!(wakes.0.load(Ordering::SeqCst), 0);
    }
}
