//! FutureAdapter: awaiting single-shot, destructively consumed values.
//!
//! Only an owned [`SingleShot`] can be awaited. The value is moved out at
//! resumption, on the fast path or after the promise's setter resumed the
//! coroutine on its own thread. Awaiting `&SingleShot` is rejected with
//! `InvalidOperation` before anything is registered.

use crate::coordinator::{Continuation, Suspension};
use crate::error::{Error, Result};
use crate::host::SingleShot;
use crate::source::{AwaitableSource, Redeemed, Registration, SourceKind};
use crate::transfer::Transfer;
use std::future::{ready, IntoFuture, Ready};

/// Adapter over an owned [`SingleShot`].
#[derive(Debug)]
pub struct FutureSource<T> {
    shot: SingleShot<T>,
}

impl<T> FutureSource<T> {
    /// Wraps an owned single-shot value.
    pub fn new(shot: SingleShot<T>) -> Self {
        Self { shot }
    }
}

impl<T: Send + 'static> AwaitableSource for FutureSource<T> {
    type Output = T;

    fn kind(&self) -> SourceKind {
        SourceKind::Future
    }

    fn validate(&self) -> Result<()> {
        if self.shot.is_consumed() {
            return Err(Error::invalid_operation(
                "single-shot value already consumed",
            ));
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.shot.is_ready()
    }

    fn transfer(&self) -> Option<Transfer> {
        Some(Transfer::select(true, false))
    }

    fn try_take_fast_path(&mut self) -> Option<Result<T>> {
        self.shot.take_value()
    }

    fn register(&mut self, continuation: Continuation) -> Result<Box<dyn Registration>> {
        match self.shot.park(continuation) {
            Ok(registration) => Ok(Box::new(registration)),
            Err(continuation) => {
                continuation.resume();
                Ok(Box::new(Redeemed))
            }
        }
    }

    fn take_resolved(&mut self) -> Result<T> {
        self.shot
            .take_value()
            .unwrap_or_else(|| Err(Error::internal("resumed before the value was set")))
    }
}

impl<T: Send + 'static> IntoFuture for SingleShot<T> {
    type Output = Result<T>;
    type IntoFuture = Suspension<FutureSource<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(FutureSource::new(self))
    }
}

impl<T> IntoFuture for &SingleShot<T> {
    type Output = Result<T>;
    type IntoFuture = Ready<Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        ready(Err(Error::invalid_operation(
            "single-shot value awaited through a shared reference",
        )))
    }
}
