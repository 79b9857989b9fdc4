//! Value transfer policy for delivered values.
//!
//! Every adapter hands its result to the resumed coroutine through a
//! [`Delivered`] record. The [`Transfer`] policy decides how the record is
//! built:
//!
//! - **Move** when the await expression owns the source and the source gives
//!   up its storage (single-shot values, owned coroutine handles, delegate
//!   arguments).
//! - **Copy** when the await expression only borrows a source whose storage
//!   must stay intact (borrowed coroutine handles).
//! - **Lease** when the source retains its result and stays queryable (tasks).
//!
//! A [`Lease`] is a shared reference into retained storage whose validity
//! window ends at the receiving coroutine's next suspension or completion.

use crate::coordinator::context;
use crate::error::{Error, ErrorKind, Result};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a delivered value leaves its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transfer {
    /// Ownership moves out of the source.
    Move,
    /// The source keeps its value; the coroutine receives a clone.
    Copy,
    /// The source keeps its value; the coroutine receives a bounded reference.
    Lease,
}

impl Transfer {
    /// Selects the policy for an await expression.
    ///
    /// `retained` sources always lease. Otherwise an owning await moves and a
    /// borrowing await copies.
    #[must_use]
    pub const fn select(owning: bool, retained: bool) -> Self {
        match (owning, retained) {
            (_, true) => Self::Lease,
            (true, false) => Self::Move,
            (false, false) => Self::Copy,
        }
    }
}

/// Transient record produced at resumption.
pub enum Delivered<T> {
    /// A value moved out of the source.
    Moved(T),
    /// A copy of the source's value.
    Copied(T),
    /// A bounded reference into the source's retained storage.
    Leased(Lease<T>),
    /// The source produced no value (unit-valued sources).
    Empty,
}

fn is_unit<T: 'static>() -> bool {
    std::any::TypeId::of::<T>() == std::any::TypeId::of::<()>()
}

impl<T: 'static> Delivered<T> {
    /// Wraps a value that left its source by move.
    #[must_use]
    pub fn moved(value: T) -> Self {
        if is_unit::<T>() {
            Self::Empty
        } else {
            Self::Moved(value)
        }
    }

    /// Copies a value out of storage the source keeps.
    #[must_use]
    pub fn copied(value: &T) -> Self
    where
        T: Clone,
    {
        if is_unit::<T>() {
            Self::Empty
        } else {
            Self::Copied(value.clone())
        }
    }

    /// Leases retained storage for the current coroutine's window.
    #[must_use]
    pub fn leased(storage: Arc<T>) -> Self {
        Self::Leased(Lease::new(storage))
    }

    /// Returns the policy that produced this record.
    #[must_use]
    pub const fn transfer(&self) -> Option<Transfer> {
        match self {
            Self::Moved(_) => Some(Transfer::Move),
            Self::Copied(_) => Some(Transfer::Copy),
            Self::Leased(_) => Some(Transfer::Lease),
            Self::Empty => None,
        }
    }

    /// Returns true for unit-valued deliveries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Extracts an owned value.
    ///
    /// Leased records cannot be turned into owned values.
    pub fn into_value(self) -> Result<T> {
        match self {
            Self::Moved(v) | Self::Copied(v) => Ok(v),
            Self::Empty => {
                let unit: Box<dyn Any> = Box::new(());
                unit.downcast::<T>()
                    .map(|v| *v)
                    .map_err(|_| Error::internal("empty delivery for a non-unit value"))
            }
            Self::Leased(_) => Err(Error::invalid_operation(
                "leased value is owned by its source",
            )),
        }
    }

    /// Extracts the lease.
    pub fn into_lease(self) -> Result<Lease<T>> {
        match self {
            Self::Leased(lease) => Ok(lease),
            _ => Err(Error::invalid_operation("delivered value is not leased")),
        }
    }
}

impl<T> fmt::Debug for Delivered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Moved(_) => f.write_str("Delivered::Moved(..)"),
            Self::Copied(_) => f.write_str("Delivered::Copied(..)"),
            Self::Leased(lease) => write!(f, "Delivered::Leased(live: {})", lease.is_live()),
            Self::Empty => f.write_str("Delivered::Empty"),
        }
    }
}

struct Window {
    epoch: Arc<AtomicU64>,
    opened_at: u64,
}

/// Shared reference into a source's retained result.
///
/// Created inside a coroutine, the lease is readable until that coroutine
/// next suspends or completes. Created outside any coroutine, it never
/// expires.
pub struct Lease<T> {
    storage: Arc<T>,
    window: Option<Window>,
}

impl<T> Lease<T> {
    /// Leases `storage` for the current coroutine's window.
    #[must_use]
    pub fn new(storage: Arc<T>) -> Self {
        let window = context::current_epoch().map(|epoch| {
            let opened_at = epoch.load(Ordering::Acquire);
            Window { epoch, opened_at }
        });
        Self { storage, window }
    }

    /// Leases `storage` without a window.
    #[must_use]
    pub fn unbounded(storage: Arc<T>) -> Self {
        Self {
            storage,
            window: None,
        }
    }

    /// Returns true while the window is open.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.window
            .as_ref()
            .map_or(true, |w| w.epoch.load(Ordering::Acquire) == w.opened_at)
    }

    /// Borrows the leased value.
    ///
    /// Fails with `LeaseExpired` once the receiving coroutine has suspended
    /// or completed since the lease was created.
    pub fn get(&self) -> Result<&T> {
        if self.is_live() {
            Ok(&self.storage)
        } else {
            Err(Error::new(ErrorKind::LeaseExpired)
                .with_message("lease read after the coroutine suspended"))
        }
    }

    /// Clones the leased value out while the window is open.
    pub fn cloned(&self) -> Result<T>
    where
        T: Clone,
    {
        self.get().cloned()
    }

    /// Returns true if both leases point at the same storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

impl<T: fmt::Debug> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Lease");
        match self.get() {
            Ok(v) => s.field("value", v),
            Err(_) => s.field("value", &"<expired>"),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_policy() {
        assert_eq!(Transfer::select(true, false), Transfer::Move);
        assert_eq!(Transfer::select(false, false), Transfer::Copy);
        assert_eq!(Transfer::select(true, true), Transfer::Lease);
        assert_eq!(Transfer::select(false, true), Transfer::Lease);
    }

    #[test]
    fn unit_values_deliver_empty() {
        let moved = Delivered::moved(());
        assert!(moved.is_empty());
        assert_eq!(moved.transfer(), None);
        moved.into_value().expect("unit value");

        assert!(Delivered::copied(&()).is_empty());
    }

    #[test]
    fn moved_and_copied_carry_values() {
        let moved = Delivered::moved(String::from("a"));
        assert_eq!(moved.transfer(), Some(Transfer::Move));
        assert_eq!(moved.into_value().expect("moved"), "a");

        let source = vec![1, 2, 3];
        let copied = Delivered::copied(&source);
        assert_eq!(copied.transfer(), Some(Transfer::Copy));
        assert_eq!(copied.into_value().expect("copied"), source);
    }

    #[test]
    fn leased_is_not_owned() {
        let storage = Arc::new(10);
        let delivered = Delivered::leased(Arc::clone(&storage));
        assert_eq!(delivered.transfer(), Some(Transfer::Lease));
        let err = Delivered::leased(Arc::clone(&storage))
            .into_value()
            .expect_err("lease is not owned");
        assert!(err.is_invalid_operation());

        let lease = delivered.into_lease().expect("lease");
        assert_eq!(*lease.get().expect("live"), 10);
        assert!(lease.ptr_eq(&Lease::unbounded(storage)));
    }

    #[test]
    fn lease_outside_coroutine_never_expires() {
        let lease = Lease::new(Arc::new(5));
        assert!(lease.is_live());
        assert_eq!(lease.cloned().expect("live"), 5);
    }

    #[test]
    fn lease_expires_when_epoch_moves() {
        let epoch = Arc::new(AtomicU64::new(3));
        let lease = Lease {
            storage: Arc::new("value"),
            window: Some(Window {
                epoch: Arc::clone(&epoch),
                opened_at: 3,
            }),
        };
        assert_eq!(*lease.get().expect("live"), "value");
        epoch.fetch_add(1, Ordering::AcqRel);
        assert!(!lease.is_live());
        let err = lease.get().expect_err("expired");
        assert_eq!(err.kind(), ErrorKind::LeaseExpired);
    }
}
