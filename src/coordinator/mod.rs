//! Suspension coordinator.
//!
//! The coordinator owns everything between "a coroutine reached an await" and
//! "the coroutine body runs again":
//!
//! - [`Suspension`]: the per-await driver (fast path, registration,
//!   resumption)
//! - [`Continuation`]: what a source invokes to resume the coroutine
//! - the pending-await record whose resolution flag arbitrates completion
//!   against cancellation
//! - [`Coroutine`]: the handle and driver of a coroutine body
//!
//! # Cancellation
//!
//! [`Coroutine::cancel`] records a request on the coroutine's token. If the
//! coroutine is suspended, the requester races the source for the pending
//! await; the winner alone unregisters and wakes the coroutine. A winning
//! request unwinds the body (drops it, running destructors) instead of
//! resuming it. Requests that find no pending await are consumed at the
//! next await point. [`non_cancelable`] defers both.

pub(crate) mod context;
pub mod coroutine;
pub(crate) mod pending;
pub mod suspension;

use crate::tracing_compat::trace;
use crate::types::CoroutineId;
use context::CoroutineShared;
use std::fmt;
use std::sync::Arc;

pub use coroutine::{Coroutine, CoroutineBuilder};
pub use pending::Continuation;
pub use suspension::Suspension;

/// Returns true if cancellation was requested for the current coroutine.
///
/// Outside a coroutine this is always false.
#[must_use]
pub fn cancel_requested() -> bool {
    context::current().is_some_and(|c| c.token.is_cancelled())
}

/// Returns the id of the coroutine being polled on this thread.
#[must_use]
pub fn current_coroutine() -> Option<CoroutineId> {
    context::current().map(|c| c.id)
}

/// Defers cancellation of the current coroutine while the guard lives.
///
/// Requests made meanwhile are recorded and take effect at the first await
/// after the last guard drops. Outside a coroutine the guard does nothing.
pub fn non_cancelable() -> NonCancelable {
    let owner = context::current();
    if let Some(owner) = &owner {
        trace!(coroutine = %owner.id, "entering non-cancelable scope");
        owner.defer_cancellation();
    }
    NonCancelable { owner }
}

/// Guard returned by [`non_cancelable`].
#[must_use = "cancellation is only deferred while the guard is alive"]
pub struct NonCancelable {
    owner: Option<Arc<CoroutineShared>>,
}

impl Drop for NonCancelable {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.resume_cancellation();
        }
    }
}

impl fmt::Debug for NonCancelable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonCancelable")
            .field("coroutine", &self.owner.as_ref().map(|c| c.id))
            .finish()
    }
}
