//! Thread affinity enforcement.
//!
//! A coroutine is either unrestricted, resuming on whichever thread resolved
//! its await, or pinned to one [`ThreadDescriptor`]. Every resumption passes
//! through [`Affinity::dispatch`], which runs the resumption inline when the
//! current thread satisfies the requirement and otherwise posts it to the
//! required thread's queue. This is the only place a thread hop is inserted.

use crate::coordinator::context::CoroutineShared;
use crate::error::{Error, Result};
use crate::tracing_compat::{debug, error, trace};
use crate::types::{CancelReason, CoroutineId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// A unit of work posted to a thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that accepts work on behalf of one thread.
///
/// Implemented by host queues. `post` must not block and must not run the
/// job inline.
pub trait PostTarget: Send + Sync + 'static {
    /// Enqueues a job. Fails with `ThreadUnavailable` once the target stopped
    /// accepting work.
    fn post(&self, job: Job) -> Result<()>;
}

/// Live coroutines pinned to one thread, keyed by id.
///
/// Entries are weak; a coroutine leaves the set when it completes.
#[derive(Default)]
pub(crate) struct PinnedSet {
    live: Mutex<HashMap<CoroutineId, Weak<CoroutineShared>>>,
}

impl PinnedSet {
    pub(crate) fn insert(&self, shared: &Arc<CoroutineShared>) {
        let mut live = self.live.lock();
        live.retain(|_, weak| weak.strong_count() > 0);
        live.insert(shared.id, Arc::downgrade(shared));
    }

    pub(crate) fn remove(&self, id: CoroutineId) {
        self.live.lock().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.live
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Requests cancellation of every live member. Returns how many were
    /// asked.
    ///
    /// Requests are issued outside the lock: a winning request may unwind
    /// the coroutine inline, which removes it from this set.
    pub(crate) fn cancel_all(&self, reason: &CancelReason) -> usize {
        let members: Vec<Arc<CoroutineShared>> = {
            let mut live = self.live.lock();
            live.drain().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for shared in &members {
            shared.request_cancel(reason);
        }
        if !members.is_empty() {
            debug!(count = members.len(), reason = %reason, "cancelled pinned coroutines");
        }
        members.len()
    }
}

/// Identifies one OS thread and how to post work to it.
#[derive(Clone)]
pub struct ThreadDescriptor {
    id: ThreadId,
    name: Arc<str>,
    target: Arc<dyn PostTarget>,
    pinned: Arc<PinnedSet>,
}

impl ThreadDescriptor {
    /// Creates a descriptor for `id` that posts through `target`.
    #[must_use]
    pub fn new(id: ThreadId, name: impl Into<Arc<str>>, target: Arc<dyn PostTarget>) -> Self {
        Self::with_pinned(id, name.into(), target, Arc::new(PinnedSet::default()))
    }

    /// A descriptor whose pinned coroutines are tracked in `pinned`, shared
    /// with the queue that owns the thread.
    pub(crate) fn with_pinned(
        id: ThreadId,
        name: Arc<str>,
        target: Arc<dyn PostTarget>,
        pinned: Arc<PinnedSet>,
    ) -> Self {
        Self {
            id,
            name,
            target,
            pinned,
        }
    }

    pub(crate) fn pinned(&self) -> &PinnedSet {
        &self.pinned
    }

    /// Returns the OS thread id.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the thread's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true when called from the described thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }

    /// Posts a job to the described thread.
    pub fn post(&self, job: Job) -> Result<()> {
        self.target.post(job).map_err(|e| {
            error!(thread = %self.name, error = %e, "post to pinned thread failed");
            e
        })
    }

    /// Runs `job` inline if this is the current thread, else posts it.
    pub fn run_or_post(&self, job: Job) -> Result<Dispatch> {
        if self.is_current() {
            job();
            Ok(Dispatch::Inline)
        } else {
            trace!(thread = %self.name, "bouncing resumption to required thread");
            self.post(job)?;
            Ok(Dispatch::Posted)
        }
    }
}

impl PartialEq for ThreadDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadDescriptor {}

impl fmt::Debug for ThreadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// How a resumption was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Ran on the calling thread.
    Inline,
    /// Queued for another thread.
    Posted,
}

/// Where a coroutine may resume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Affinity {
    /// Any thread.
    #[default]
    Unrestricted,
    /// Only the given thread.
    Pinned(ThreadDescriptor),
}

impl Affinity {
    /// Returns the pinned thread, if any.
    #[must_use]
    pub fn pinned_thread(&self) -> Option<&ThreadDescriptor> {
        match self {
            Self::Unrestricted => None,
            Self::Pinned(thread) => Some(thread),
        }
    }

    /// Returns true if the current thread may run the coroutine.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.pinned_thread().map_or(true, ThreadDescriptor::is_current)
    }

    /// Runs `job` inline when the affinity is satisfied, else posts it to
    /// the pinned thread.
    pub fn dispatch(&self, job: Job) -> Result<Dispatch> {
        match self {
            Self::Unrestricted => {
                job();
                Ok(Dispatch::Inline)
            }
            Self::Pinned(thread) => thread.run_or_post(job),
        }
    }
}

/// Routes `job` through an optional source-side requirement.
pub(crate) fn dispatch_required(requirement: Option<&ThreadDescriptor>, job: Job) -> Result<Dispatch> {
    match requirement {
        Some(thread) => thread.run_or_post(job),
        None => {
            job();
            Ok(Dispatch::Inline)
        }
    }
}

/// Fails with `ThreadUnavailable` for `thread`.
pub(crate) fn unavailable(thread: &str) -> Error {
    Error::thread_unavailable(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingTarget {
        jobs: Mutex<Vec<Job>>,
        closed: AtomicBool,
    }

    impl PostTarget for RecordingTarget {
        fn post(&self, job: Job) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(unavailable("recorder"));
            }
            self.jobs.lock().push(job);
            Ok(())
        }
    }

    fn other_thread_descriptor(target: Arc<RecordingTarget>) -> ThreadDescriptor {
        let id = thread::spawn(|| thread::current().id())
            .join()
            .expect("id thread panicked");
        ThreadDescriptor::new(id, "other", target)
    }

    #[test]
    fn unrestricted_runs_inline() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let dispatch = Affinity::Unrestricted
            .dispatch(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("dispatch");
        assert_eq!(dispatch, Dispatch::Inline);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pinned_to_current_runs_inline() {
        let target = Arc::new(RecordingTarget::default());
        let here = ThreadDescriptor::new(thread::current().id(), "here", target.clone());
        let affinity = Affinity::Pinned(here);
        assert!(affinity.is_satisfied());
        let dispatch = affinity.dispatch(Box::new(|| {})).expect("dispatch");
        assert_eq!(dispatch, Dispatch::Inline);
        assert!(target.jobs.lock().is_empty());
    }

    #[test]
    fn pinned_elsewhere_posts() {
        let target = Arc::new(RecordingTarget::default());
        let affinity = Affinity::Pinned(other_thread_descriptor(target.clone()));
        assert!(!affinity.is_satisfied());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let dispatch = affinity
            .dispatch(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("dispatch");
        assert_eq!(dispatch, Dispatch::Posted);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let jobs = std::mem::take(&mut *target.jobs.lock());
        assert_eq!(jobs.len(), 1);
        for job in jobs {
            job();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_target_reports_thread_unavailable() {
        let target = Arc::new(RecordingTarget::default());
        target.closed.store(true, Ordering::Release);
        let affinity = Affinity::Pinned(other_thread_descriptor(target));
        let err = affinity.dispatch(Box::new(|| {})).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::ThreadUnavailable);
    }

    #[test]
    fn descriptors_compare_by_thread() {
        let a = ThreadDescriptor::new(
            thread::current().id(),
            "a",
            Arc::new(RecordingTarget::default()),
        );
        let b = ThreadDescriptor::new(
            thread::current().id(),
            "b",
            Arc::new(RecordingTarget::default()),
        );
        assert_eq!(a, b);
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn required_thread_none_runs_inline() {
        let dispatch = dispatch_required(None, Box::new(|| {})).expect("dispatch");
        assert_eq!(dispatch, Dispatch::Inline);
    }
}
