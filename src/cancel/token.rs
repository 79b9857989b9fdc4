//! Tri-state cancellation token.

use crate::shim::{AtomicU8, Mutex, Ordering};
use crate::types::CancelReason;
use std::fmt;
use std::sync::Arc;

const ACTIVE: u8 = 0;
const REQUESTED: u8 = 1;
const CONSUMED: u8 = 2;

/// Observable state of a [`CancelToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelState {
    /// No cancellation has been requested.
    Active,
    /// Cancellation was requested and not yet acted upon.
    CancelRequested,
    /// The coordinator took the request and is unwinding the coroutine.
    Consumed,
}

impl CancelState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            ACTIVE => Self::Active,
            REQUESTED => Self::CancelRequested,
            _ => Self::Consumed,
        }
    }
}

struct TokenInner {
    state: AtomicU8,
    reason: Mutex<Option<CancelReason>>,
}

/// Cross-thread cancellation flag with a strengthened reason.
///
/// Transitions only move forward: `Active -> CancelRequested -> Consumed`.
/// Clones share the same state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Creates an active token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: AtomicU8::new(ACTIVE),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CancelState {
        CancelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Returns true if a request is recorded but not yet consumed.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == REQUESTED
    }

    /// Returns true once any cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != ACTIVE
    }

    /// Records a cancellation request.
    ///
    /// Returns `true` for the request that moved the token out of `Active`.
    /// Later requests only strengthen the stored reason.
    pub fn request(&self, reason: &CancelReason) -> bool {
        let mut slot = self.inner.reason.lock();
        if self.inner.state.load(Ordering::Acquire) == ACTIVE {
            *slot = Some(reason.clone());
            self.inner.state.store(REQUESTED, Ordering::Release);
            return true;
        }
        if let Some(current) = slot.as_mut() {
            current.strengthen(reason);
        }
        false
    }

    /// Takes a pending request, moving the token to `Consumed`.
    ///
    /// Exactly one caller observes `Some` for a given request.
    pub fn consume(&self) -> Option<CancelReason> {
        self.inner
            .state
            .compare_exchange(REQUESTED, CONSUMED, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(self.inner.reason.lock().clone().unwrap_or_default())
    }

    /// Returns the recorded reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.lock().clone()
    }

    /// Returns true if both handles share one token.
    #[must_use]
    pub fn same_token(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("state", &self.state())
            .field("reason", &self.reason())
            .finish()
    }
}
