//! Core types shared across the adapter layer.
//!
//! - [`id`]: coroutine identifiers
//! - [`cancel`]: cancellation reason and kind types
//! - [`outcome`]: three-valued coroutine outcome

pub mod cancel;
pub mod id;
pub mod outcome;

pub use cancel::{CancelKind, CancelReason};
pub use id::CoroutineId;
pub use outcome::{Outcome, PanicPayload};
