//! Delegates: single-binding and multicast callback sources.
//!
//! Invocation is synchronous on the invoking thread. Handlers are cloned out
//! of the delegate before they run, so a handler may unbind itself, or bind
//! another, while it is being invoked.

use crate::error::Result;
use crate::tracing_compat::trace;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_BINDING: AtomicU64 = AtomicU64::new(1);

/// A bound callback.
pub type Handler<A, R> = Arc<dyn Fn(A) -> R + Send + Sync + 'static>;

/// Identifies one binding on a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

impl BindingId {
    fn next() -> Self {
        Self(NEXT_BINDING.fetch_add(1, Ordering::Relaxed))
    }
}

/// Subscription token returned by [`Bindable::bind`].
///
/// Consumed by [`unbind`](Self::unbind), so a binding is redeemed at most
/// once. Holds only a weak reference to its delegate.
pub struct Binding {
    id: BindingId,
    unbind: Box<dyn FnOnce(BindingId) -> bool + Send>,
}

impl Binding {
    /// Creates a binding that runs `unbind` when redeemed.
    pub fn new(id: BindingId, unbind: impl FnOnce(BindingId) -> bool + Send + 'static) -> Self {
        Self {
            id,
            unbind: Box::new(unbind),
        }
    }

    /// The binding's id.
    #[must_use]
    pub fn id(&self) -> BindingId {
        self.id
    }

    /// Removes the handler. Returns false if the delegate is gone or the
    /// handler had already been replaced.
    pub fn unbind(self) -> bool {
        (self.unbind)(self.id)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("id", &self.id).finish()
    }
}

/// A callback source a coroutine can subscribe to.
pub trait Bindable<A, R>: Send + Sync {
    /// Binds `handler`. The source must invoke it synchronously on whatever
    /// thread fires the source.
    fn bind(&self, handler: Handler<A, R>) -> Result<Binding>;
}

/// A by-reference callback parameter.
///
/// Clones alias one storage cell, so a write through the clone a coroutine
/// received is visible to the invoker once the invoking call returns.
pub struct RefArg<T> {
    cell: Arc<Mutex<T>>,
}

impl<T> RefArg<T> {
    /// Wraps `value` in a shared cell.
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(Mutex::new(value)),
        }
    }

    /// Overwrites the value.
    pub fn set(&self, value: T) {
        *self.cell.lock() = value;
    }

    /// Runs `f` with mutable access to the value.
    pub fn with<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut self.cell.lock())
    }

    /// Returns true if both parameters alias the same cell.
    #[must_use]
    pub fn aliases(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: Clone> RefArg<T> {
    /// Copies the value out.
    #[must_use]
    pub fn get(&self) -> T {
        self.cell.lock().clone()
    }
}

impl<T> Clone for RefArg<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RefArg<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefArg").field(&*self.cell.lock()).finish()
    }
}

type Slot<A, R> = Mutex<Option<(BindingId, Handler<A, R>)>>;

/// A delegate with at most one bound handler. Binding replaces the previous
/// handler.
pub struct Delegate<A, R = ()> {
    slot: Arc<Slot<A, R>>,
}

impl<A, R> Delegate<A, R> {
    /// An unbound delegate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns true if a handler is bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Removes whatever handler is bound.
    pub fn clear(&self) -> bool {
        let removed = self.slot.lock().take();
        removed.is_some()
    }

    /// Invokes the bound handler on this thread.
    ///
    /// Returns `None` if nothing is bound.
    pub fn execute(&self, args: A) -> Option<R> {
        let handler = self.slot.lock().as_ref().map(|(_, h)| Arc::clone(h))?;
        Some(handler(args))
    }

    fn unbind_from(slot: &Weak<Slot<A, R>>, id: BindingId) -> bool {
        let Some(slot) = slot.upgrade() else {
            return false;
        };
        let mut guard = slot.lock();
        if guard.as_ref().is_some_and(|(bound, _)| *bound == id) {
            let removed = guard.take();
            drop(guard);
            drop(removed);
            return true;
        }
        false
    }
}

impl<A: 'static, R: 'static> Bindable<A, R> for Delegate<A, R> {
    fn bind(&self, handler: Handler<A, R>) -> Result<Binding> {
        let id = BindingId::next();
        let previous = self.slot.lock().replace((id, handler));
        drop(previous);
        trace!(binding = ?id, "delegate bound");
        let slot = Arc::downgrade(&self.slot);
        Ok(Binding::new(id, move |id| Self::unbind_from(&slot, id)))
    }
}

impl<A, R> Clone for Delegate<A, R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<A, R> Default for Delegate<A, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, R> fmt::Debug for Delegate<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegate")
            .field("bound", &self.is_bound())
            .finish()
    }
}

type Handlers<A> = Mutex<Vec<(BindingId, Handler<A, ()>)>>;

/// A delegate broadcasting to any number of handlers.
pub struct MulticastDelegate<A> {
    handlers: Arc<Handlers<A>>,
}

impl<A> MulticastDelegate<A> {
    /// A delegate with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Adds a handler.
    pub fn add(&self, handler: impl Fn(A) + Send + Sync + 'static) -> BindingId {
        let id = BindingId::next();
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns false if it was not bound.
    pub fn remove(&self, id: BindingId) -> bool {
        Self::remove_from(&self.handlers, id)
    }

    /// Number of bound handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Returns true if no handler is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Invokes every handler bound at the time of the call, in bind order.
    pub fn broadcast(&self, args: A)
    where
        A: Clone,
    {
        let snapshot: Vec<Handler<A, ()>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(args.clone());
        }
    }

    fn remove_from(handlers: &Handlers<A>, id: BindingId) -> bool {
        let removed = {
            let mut handlers = handlers.lock();
            handlers
                .iter()
                .position(|(bound, _)| *bound == id)
                .map(|index| handlers.remove(index))
        };
        removed.is_some()
    }
}

impl<A: 'static> Bindable<A, ()> for MulticastDelegate<A> {
    fn bind(&self, handler: Handler<A, ()>) -> Result<Binding> {
        let id = BindingId::next();
        self.handlers.lock().push((id, handler));
        trace!(binding = ?id, "multicast handler bound");
        let handlers = Arc::downgrade(&self.handlers);
        Ok(Binding::new(id, move |id| {
            handlers
                .upgrade()
                .is_some_and(|handlers| Self::remove_from(&handlers, id))
        }))
    }
}

impl<A> Clone for MulticastDelegate<A> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<A> Default for MulticastDelegate<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for MulticastDelegate<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastDelegate")
            .field("handlers", &self.len())
            .finish()
    }
}
