//! Three-valued outcome of a coroutine.
//!
//! - `Ok(T)`: the body returned a value
//! - `Cancelled(CancelReason)`: the body was unwound by cancellation
//! - `Panicked(PanicPayload)`: the body panicked

use super::cancel::CancelReason;
use crate::error::{Error, Result};
use core::fmt;
use std::any::Any;

/// Payload from a caught panic.
///
/// This wraps the panic value for safe transport across threads.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a new panic payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Builds a payload from the value returned by `catch_unwind`.
    #[must_use]
    pub fn from_unwind(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self { message }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// The final state of a coroutine.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The body completed with a value.
    Ok(T),
    /// The body was cancelled and unwound.
    Cancelled(CancelReason),
    /// The body panicked.
    Panicked(PanicPayload),
}

impl<T> Outcome<T> {
    /// Returns true if this outcome is `Ok`.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Returns true if this outcome is `Cancelled`.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns true if this outcome is `Panicked`.
    #[must_use]
    pub const fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Converts to the crate `Result`, mapping cancellation and panic to errors.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Cancelled(r) => Err(Error::cancelled(&r)),
            Self::Panicked(p) => Err(Error::panicked(&p)),
        }
    }

    /// Returns the success value or panics.
    ///
    /// # Panics
    ///
    /// Panics if the outcome is not `Ok`.
    #[track_caller]
    pub fn unwrap(self) -> T {
        match self {
            Self::Ok(v) => v,
            Self::Cancelled(r) => {
                panic!("called `Outcome::unwrap()` on a `Cancelled` value: {r}")
            }
            Self::Panicked(p) => panic!("called `Outcome::unwrap()` on a `Panicked` value: {p}"),
        }
    }
}
