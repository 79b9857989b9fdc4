//! Identifier types for coroutines.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier for a coroutine instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(u64);

impl CoroutineId {
    /// Allocates the next identifier.
    #[must_use]
    pub(crate) fn next() -> Self {
        Self(NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a coroutine ID for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoroutineId({})", self.0)
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coroutine#{}", self.0)
    }
}
