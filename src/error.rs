//! Error types and error handling strategy for Coadapt.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Misuse is rejected at the await call site, before any registration
//! - Cross-thread races are settled by atomic arbitration, never by
//!   surfacing an error on an arbitrary thread
//! - Nothing in this layer retries; retry policy belongs to the awaited source
//!
//! # Error Categories
//!
//! - **Cancellation**: the awaiting or awaited coroutine was cancelled
//! - **Usage**: structurally invalid awaits (destructive source awaited twice)
//! - **Source**: the awaited primitive went away or failed
//! - **Threading**: a resumption could not be posted to its required thread
//! - **Config**: invalid host configuration
//! - **Internal**: broken invariants inside the layer

use core::fmt;
use std::sync::Arc;

use crate::types::{CancelReason, CoroutineId, PanicPayload};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Cancellation ===
    /// The awaited coroutine was cancelled before producing a value.
    Cancelled,

    // === Usage ===
    /// Awaiting a destructive source through a non-owning handle, awaiting an
    /// already consumed source, or overlapping two awaits in one coroutine.
    InvalidOperation,
    /// A leased reference was read after its validity window closed.
    LeaseExpired,

    // === Source ===
    /// The source dropped its registration without ever resolving it.
    SourceAbandoned,
    /// The awaited coroutine panicked.
    Panicked,

    // === Threading ===
    /// The thread a resumption must run on no longer accepts work.
    ThreadUnavailable,

    // === Config ===
    /// Host configuration could not be loaded or applied.
    Config,

    // === Internal ===
    /// Internal error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::InvalidOperation | Self::LeaseExpired => ErrorCategory::Usage,
            Self::SourceAbandoned | Self::Panicked => ErrorCategory::Source,
            Self::ThreadUnavailable => ErrorCategory::Threading,
            Self::Config => ErrorCategory::Config,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns true if the failure is a programming error at the await site.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(self.category(), ErrorCategory::Usage)
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Cancellation-related failures.
    Cancellation,
    /// Invalid use of an awaitable.
    Usage,
    /// Failures reported by or about the awaited primitive.
    Source,
    /// Thread affinity failures.
    Threading,
    /// Configuration failures.
    Config,
    /// Internal errors.
    Internal,
}

/// The main error type for Coadapt operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    coroutine: Option<CoroutineId>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            coroutine: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error rejected an invalid await.
    #[must_use]
    pub const fn is_invalid_operation(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidOperation)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Records the coroutine the error concerns.
    #[must_use]
    pub fn with_coroutine(mut self, id: CoroutineId) -> Self {
        self.coroutine = Some(id);
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the coroutine the error concerns, if recorded.
    #[must_use]
    pub const fn coroutine(&self) -> Option<CoroutineId> {
        self.coroutine
    }

    /// Creates an invalid-operation error.
    #[must_use]
    pub fn invalid_operation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation).with_message(detail)
    }

    /// Creates a cancellation error from a structured reason.
    #[must_use]
    pub fn cancelled(reason: &CancelReason) -> Self {
        Self::new(ErrorKind::Cancelled).with_message(format!("{reason}"))
    }

    /// Creates a panic error from a captured payload.
    #[must_use]
    pub fn panicked(payload: &PanicPayload) -> Self {
        Self::new(ErrorKind::Panicked).with_message(payload.message())
    }

    /// Creates a source-abandoned error.
    #[must_use]
    pub fn abandoned(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::SourceAbandoned).with_message(detail)
    }

    /// Creates a thread-unavailable error for the named thread.
    #[must_use]
    pub fn thread_unavailable(thread: &str) -> Self {
        Self::new(ErrorKind::ThreadUnavailable)
            .with_message(format!("thread {thread} no longer accepts work"))
    }

    /// Creates an internal error (bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        if let Some(id) = self.coroutine {
            write!(f, " ({id})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(e: crate::config::ConfigError) -> Self {
        Self::new(ErrorKind::Config)
            .with_message(e.to_string())
            .with_source(e)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
    /// Attach context message computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_message(f()))
    }
}

/// A specialized Result type for Coadapt operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_message() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_message_and_coroutine() {
        let err = Error::invalid_operation("awaited twice").with_coroutine(CoroutineId::new_for_test(7));
        assert_eq!(err.to_string(), "InvalidOperation: awaited twice (coroutine#7)");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::Internal)
            .with_message("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn categories() {
        assert_eq!(ErrorKind::Cancelled.category(), ErrorCategory::Cancellation);
        assert_eq!(ErrorKind::LeaseExpired.category(), ErrorCategory::Usage);
        assert_eq!(ErrorKind::SourceAbandoned.category(), ErrorCategory::Source);
        assert_eq!(
            ErrorKind::ThreadUnavailable.category(),
            ErrorCategory::Threading
        );
        assert!(ErrorKind::InvalidOperation.is_usage());
        assert!(!ErrorKind::Panicked.is_usage());
    }

    #[test]
    fn predicates_match_kind() {
        let cancel = Error::cancelled(&CancelReason::shutdown());
        assert!(cancel.is_cancelled());
        assert!(!cancel.is_invalid_operation());
        assert_eq!(cancel.message(), Some("thread shutdown"));
    }

    #[test]
    fn result_ext_adds_message() {
        let res: core::result::Result<(), Error> = Err(Error::new(ErrorKind::SourceAbandoned));
        let err = res.context("promise dropped").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::SourceAbandoned);
        assert_eq!(err.to_string(), "SourceAbandoned: promise dropped");
    }
}
