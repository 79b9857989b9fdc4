//! The await-point driver.

use crate::coordinator::context::{self, CoroutineShared};
use crate::coordinator::pending::{PendingAwait, Resolution};
use crate::coordinator::Continuation;
use crate::error::{Error, Result};
use crate::source::AwaitableSource;
use crate::tracing_compat::trace;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

struct Registered {
    pending: Arc<PendingAwait>,
    owner: Arc<CoroutineShared>,
}

enum State {
    Init,
    Registered(Registered),
    Done,
}

/// Future returned by awaiting any [`AwaitableSource`].
///
/// Polled inside a coroutine body, it runs the whole await protocol: it
/// consumes a recorded cancellation, validates the source, takes the fast
/// path when the source is already resolved, and otherwise publishes a
/// pending await, registers a [`Continuation`] and suspends until the
/// continuation resumes it.
///
/// Dropping a registered suspension races the source like a cancellation
/// would, so the registration is still redeemed exactly once.
#[must_use = "futures do nothing unless awaited"]
pub struct Suspension<S: AwaitableSource> {
    source: S,
    state: State,
}

impl<S: AwaitableSource> Suspension<S> {
    /// Wraps `source` for awaiting.
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: State::Init,
        }
    }

    fn start(&mut self, cx: &mut Context<'_>) -> Poll<Result<S::Output>> {
        let Some(owner) = context::current() else {
            return Poll::Ready(Err(Error::invalid_operation(
                "awaitable sources can only be awaited inside a coroutine",
            )));
        };
        if owner.is_unwinding() || owner.take_cancel_at_await() {
            return Poll::Pending;
        }
        if let Err(e) = self.source.validate() {
            trace!(coroutine = %owner.id, error = %e, "await rejected");
            return Poll::Ready(Err(e.with_coroutine(owner.id)));
        }
        if self.source.is_ready() {
            if let Some(output) = self.source.try_take_fast_path() {
                owner.fast_paths.fetch_add(1, Ordering::Relaxed);
                trace!(
                    coroutine = %owner.id,
                    kind = ?self.source.kind(),
                    transfer = ?self.source.transfer(),
                    "fast path"
                );
                return Poll::Ready(output);
            }
        }

        let pending = PendingAwait::new(
            self.source.kind(),
            owner.id,
            owner.token.clone(),
            self.source.resume_thread_requirement(),
            cx.waker().clone(),
        );
        if !owner.publish(&pending) {
            return Poll::Ready(Err(Error::invalid_operation(
                "coroutine already has a pending await",
            )
            .with_coroutine(owner.id)));
        }
        match self.source.register(Continuation::new(Arc::clone(&pending))) {
            Ok(registration) => pending.install(registration),
            Err(e) => {
                owner.clear(&pending);
                return Poll::Ready(Err(e.with_coroutine(owner.id)));
            }
        }
        trace!(coroutine = %owner.id, kind = ?self.source.kind(), "registered pending await");

        // A request that landed before publication found no pending await;
        // it is settled here instead.
        if owner.token.is_requested() && owner.take_cancel_race(&pending) {
            self.state = State::Registered(Registered { pending, owner });
            return Poll::Pending;
        }
        self.poll_registered(Registered { pending, owner }, cx)
    }

    fn poll_registered(
        &mut self,
        registered: Registered,
        cx: &mut Context<'_>,
    ) -> Poll<Result<S::Output>> {
        let mut resolution = registered.pending.resolution();
        if matches!(resolution, Resolution::Pending | Resolution::Resolving) {
            registered.pending.set_waker(cx.waker());
            resolution = registered.pending.resolution();
        }
        match resolution {
            Resolution::Resolved => {
                registered.owner.clear(&registered.pending);
                trace!(
                    coroutine = %registered.owner.id,
                    transfer = ?self.source.transfer(),
                    "resumed with value"
                );
                Poll::Ready(
                    self.source
                        .take_resolved()
                        .map_err(|e| e.with_coroutine(registered.owner.id)),
                )
            }
            Resolution::Abandoned => {
                registered.owner.clear(&registered.pending);
                Poll::Ready(Err(Error::abandoned(format!(
                    "{:?} source dropped its continuation",
                    registered.pending.kind()
                ))
                .with_coroutine(registered.owner.id)))
            }
            Resolution::Pending | Resolution::Resolving | Resolution::Cancelled => {
                self.state = State::Registered(registered);
                Poll::Pending
            }
        }
    }
}

impl<S: AwaitableSource + Unpin> Future for Suspension<S> {
    type Output = Result<S::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, State::Done) {
            State::Init => this.start(cx),
            State::Registered(registered) => this.poll_registered(registered, cx),
            State::Done => Poll::Ready(Err(Error::invalid_operation(
                "await polled after it completed",
            ))),
        }
    }
}

impl<S: AwaitableSource> Drop for Suspension<S> {
    fn drop(&mut self) {
        if let State::Registered(registered) = &self.state {
            if registered.pending.try_cancel() {
                trace!(coroutine = %registered.owner.id, "await dropped while pending");
                registered.pending.unregister_now();
            }
            registered.owner.clear(&registered.pending);
        }
    }
}

impl<S: AwaitableSource> fmt::Debug for Suspension<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Init => "init",
            State::Registered(_) => "registered",
            State::Done => "done",
        };
        f.debug_struct("Suspension")
            .field("kind", &self.source.kind())
            .field("transfer", &self.source.transfer())
            .field("state", &state)
            .finish()
    }
}
