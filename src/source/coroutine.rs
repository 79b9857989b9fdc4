//! CoroutineAdapter: one coroutine awaiting another.
//!
//! `target.await` moves the target's result out; `(&target).await` copies it
//! and leaves it in place for other awaiters. A finished target is taken on
//! the fast path whatever the awaiter's affinity. Otherwise the awaiter parks
//! a continuation on the target, which fires it on the thread the target
//! finishes on; a pinned awaiter is bounced back to its own thread.
//!
//! Cancelling the awaiter only removes that continuation. The target keeps
//! running.

use crate::coordinator::{current_coroutine, Continuation, Coroutine, Suspension};
use crate::error::{Error, Result};
use crate::source::{AwaitableSource, Redeemed, Registration, SourceKind};
use crate::transfer::Transfer;
use std::fmt;
use std::future::IntoFuture;

/// Adapter over a [`Coroutine`] handle.
pub struct CoroutineSource<T> {
    target: Coroutine<T>,
    transfer: Transfer,
    take: fn(&Coroutine<T>) -> Option<Result<T>>,
}

impl<T: Send + 'static> CoroutineSource<T> {
    /// Awaits `target`, moving its result out.
    pub fn moving(target: Coroutine<T>) -> Self {
        Self {
            target,
            transfer: Transfer::select(true, false),
            take: Coroutine::take_moved,
        }
    }

    /// Awaits `target`, copying its result.
    pub fn copying(target: Coroutine<T>) -> Self
    where
        T: Clone,
    {
        Self {
            target,
            transfer: Transfer::select(false, false),
            take: Coroutine::take_copied,
        }
    }
}

impl<T> fmt::Debug for CoroutineSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineSource")
            .field("target", &self.target)
            .field("transfer", &self.transfer)
            .finish()
    }
}

impl<T: Send + 'static> AwaitableSource for CoroutineSource<T> {
    type Output = T;

    fn kind(&self) -> SourceKind {
        SourceKind::Coroutine
    }

    fn validate(&self) -> Result<()> {
        let id = self.target.id();
        if current_coroutine() == Some(id) {
            return Err(Error::invalid_operation("coroutine awaited itself").with_coroutine(id));
        }
        if self.transfer == Transfer::Move && self.target.is_moved() {
            return Err(
                Error::invalid_operation("coroutine result already moved").with_coroutine(id)
            );
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.target.is_done()
    }

    fn transfer(&self) -> Option<Transfer> {
        Some(self.transfer)
    }

    fn try_take_fast_path(&mut self) -> Option<Result<T>> {
        (self.take)(&self.target)
    }

    fn register(&mut self, continuation: Continuation) -> Result<Box<dyn Registration>> {
        match self.target.add_waiter(continuation) {
            Ok(registration) => Ok(Box::new(registration)),
            Err(continuation) => {
                continuation.resume();
                Ok(Box::new(Redeemed))
            }
        }
    }

    fn take_resolved(&mut self) -> Result<T> {
        (self.take)(&self.target)
            .unwrap_or_else(|| Err(Error::internal("resumed before the target completed")))
    }
}

impl<T: Send + 'static> IntoFuture for Coroutine<T> {
    type Output = Result<T>;
    type IntoFuture = Suspension<CoroutineSource<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(CoroutineSource::moving(self))
    }
}

impl<T: Clone + Send + 'static> IntoFuture for &Coroutine<T> {
    type Output = Result<T>;
    type IntoFuture = Suspension<CoroutineSource<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(CoroutineSource::copying(self.clone()))
    }
}
