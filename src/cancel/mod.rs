//! Cancellation token shared between a coroutine and whatever it awaits.
//!
//! The token is the first half of the cancellation protocol: the owner
//! records a request here, and the coordinator consumes it when it unwinds
//! the coroutine. The other half, the race against natural completion,
//! happens on the pending await's resolution flag.

pub mod token;

pub use token::{CancelState, CancelToken};
