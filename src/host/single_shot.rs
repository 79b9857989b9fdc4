//! Single-shot values: a [`Promise`] writes once, a [`SingleShot`] reads once.

use crate::coordinator::Continuation;
use crate::error::{Error, Result};
use crate::source::Registration;
use crate::transfer::Delivered;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

enum Value<T> {
    Empty,
    Ready(T),
    Taken,
    /// The promise was dropped unset.
    Broken,
}

struct State<T> {
    value: Value<T>,
    waiter: Option<Continuation>,
    receiver_alive: bool,
}

type Shared<T> = Arc<Mutex<State<T>>>;

/// Creates a connected promise / single-shot pair.
#[must_use]
pub fn promise<T>() -> (Promise<T>, SingleShot<T>) {
    let shared = Arc::new(Mutex::new(State {
        value: Value::Empty,
        waiter: None,
        receiver_alive: true,
    }));
    (
        Promise {
            shared: Arc::clone(&shared),
            fulfilled: false,
        },
        SingleShot { shared },
    )
}

/// Write side of a single-shot value.
///
/// Dropping it unset breaks the value; the reader then fails with
/// `SourceAbandoned`.
pub struct Promise<T> {
    shared: Shared<T>,
    fulfilled: bool,
}

impl<T> Promise<T> {
    /// Sets the value and resumes a waiting reader on this thread.
    ///
    /// Returns false if the reader is gone.
    pub fn set(mut self, value: T) -> bool {
        self.fulfilled = true;
        let waiter = {
            let mut state = self.shared.lock();
            if !state.receiver_alive {
                return false;
            }
            state.value = Value::Ready(value);
            state.waiter.take()
        };
        if let Some(waiter) = waiter {
            waiter.resume();
        }
        true
    }

    /// Returns true while a coroutine is suspended on the value.
    #[must_use]
    pub fn has_waiter(&self) -> bool {
        self.shared.lock().waiter.is_some()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }
        let waiter = {
            let mut state = self.shared.lock();
            state.value = Value::Broken;
            state.waiter.take()
        };
        drop(waiter);
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("fulfilled", &self.fulfilled)
            .finish_non_exhaustive()
    }
}

/// Read side of a single-shot value. The value can be taken exactly once.
///
/// Await it by value (`shot.await`) to move the value out. Awaiting a
/// reference fails with `InvalidOperation`, since a borrowed handle cannot
/// consume the value.
pub struct SingleShot<T> {
    shared: Shared<T>,
}

impl<T> SingleShot<T> {
    /// An already-resolved single-shot value.
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self {
            shared: Arc::new(Mutex::new(State {
                value: Value::Ready(value),
                waiter: None,
                receiver_alive: true,
            })),
        }
    }

    /// Returns true if a value, or a broken promise, is waiting.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.shared.lock().value, Value::Ready(_) | Value::Broken)
    }

    /// Returns true once the value has been taken.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        matches!(self.shared.lock().value, Value::Taken)
    }

    /// Takes the value without suspending, if it is there.
    pub fn try_take(&self) -> Option<T> {
        let mut state = self.shared.lock();
        match std::mem::replace(&mut state.value, Value::Taken) {
            Value::Ready(value) => Some(value),
            other => {
                state.value = other;
                None
            }
        }
    }

    pub(crate) fn take_value(&self) -> Option<Result<T>>
    where
        T: 'static,
    {
        let mut state = self.shared.lock();
        match &state.value {
            Value::Empty => None,
            Value::Taken => Some(Err(Error::invalid_operation(
                "single-shot value already consumed",
            ))),
            Value::Broken => Some(Err(Error::abandoned("promise dropped without a value"))),
            Value::Ready(_) => match std::mem::replace(&mut state.value, Value::Taken) {
                Value::Ready(value) => Some(Delivered::moved(value).into_value()),
                _ => None,
            },
        }
    }

    /// Parks `continuation` until the promise is set or dropped.
    ///
    /// Hands it back if the value arrived in the meantime.
    pub(crate) fn park(
        &self,
        continuation: Continuation,
    ) -> std::result::Result<ShotRegistration<T>, Continuation> {
        let mut state = self.shared.lock();
        if !matches!(state.value, Value::Empty) {
            return Err(continuation);
        }
        state.waiter = Some(continuation);
        Ok(ShotRegistration {
            shared: Arc::downgrade(&self.shared),
        })
    }
}

impl<T> Drop for SingleShot<T> {
    fn drop(&mut self) {
        let waiter = {
            let mut state = self.shared.lock();
            state.receiver_alive = false;
            state.waiter.take()
        };
        drop(waiter);
    }
}

impl<T> fmt::Debug for SingleShot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.lock().value {
            Value::Empty => "empty",
            Value::Ready(_) => "ready",
            Value::Taken => "taken",
            Value::Broken => "broken",
        };
        f.debug_struct("SingleShot").field("state", &state).finish()
    }
}

pub(crate) struct ShotRegistration<T> {
    shared: Weak<Mutex<State<T>>>,
}

impl<T: Send + 'static> Registration for ShotRegistration<T> {
    fn unregister(self: Box<Self>) {
        if let Some(shared) = self.shared.upgrade() {
            let waiter = shared.lock().waiter.take();
            drop(waiter);
        }
    }
}
