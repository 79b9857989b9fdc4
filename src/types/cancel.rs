//! Why a coroutine was cancelled.
//!
//! Requests may arrive more than once and from several threads. The token
//! keeps one reason and merges later requests into it, so the reason a
//! coroutine reports is the most severe one anybody asked for.

use core::fmt;

/// Who asked for the cancellation. Later variants are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Explicit request through the coroutine handle.
    User,
    /// The object the coroutine was working for was destroyed.
    Owner,
    /// The thread the coroutine is pinned to stopped accepting work.
    Shutdown,
}

impl CancelKind {
    const fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Owner => "owner destroyed",
            Self::Shutdown => "thread shutdown",
        }
    }
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A cancellation request: its kind and an optional static note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    /// Who asked.
    pub kind: CancelKind,
    /// Free-form note from the requester.
    pub message: Option<&'static str>,
}

impl CancelReason {
    /// A reason of `kind` without a note.
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// A user request with a note.
    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self {
            kind: CancelKind::User,
            message: Some(message),
        }
    }

    /// The coroutine's owner was destroyed.
    #[must_use]
    pub const fn owner_gone() -> Self {
        Self::new(CancelKind::Owner)
    }

    /// The coroutine's pinned thread is shutting down.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }

    /// Merges a later request into this one.
    ///
    /// A more severe kind replaces the reason outright; a request of the same
    /// kind only fills in a missing note. Returns true if anything changed.
    pub fn strengthen(&mut self, other: &Self) -> bool {
        let replace = other.kind > self.kind
            || (other.kind == self.kind && self.message.is_none() && other.message.is_some());
        if replace {
            *self = other.clone();
        }
        replace
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new(CancelKind::User)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(note) => write!(f, "{} ({note})", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}
