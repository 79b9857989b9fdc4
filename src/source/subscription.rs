//! SubscriptionAdapter: awaiting one invocation of a callback source.
//!
//! Suspending binds a handler into the source. When the source fires, the
//! handler runs on the invoking thread and resumes the coroutine right there,
//! synchronously, before the invoking call returns; only a pinned coroutine
//! is bounced to its own thread. Arguments arrive as one tuple, so any arity
//! is handled by the same code; by-reference parameters are [`RefArg`]s that
//! alias the invoker's storage.
//!
//! The invoking call receives `R::default()` as soon as the coroutine
//! reaches its next suspension or completes, whatever the coroutine goes on
//! to produce.
//!
//! The binding is redeemed exactly once, by whichever of the invoking thread
//! and a cancelling thread wins the pending await. A handler that is invoked
//! again after that, for example through a copy the source kept, finds its
//! continuation gone and returns without touching the coroutine.
//!
//! The handler is the only owner of the continuation. A source that drops
//! the handler without invoking it (a single-cast delegate rebound by another
//! awaiter, a delegate that is cleared) thereby drops the continuation, and
//! the coroutine resumes with `SourceAbandoned`.
//!
//! [`RefArg`]: crate::host::RefArg

use crate::coordinator::{Continuation, Suspension};
use crate::error::{Error, Result};
use crate::host::{Binding, Bindable, Delegate, Handler, MulticastDelegate};
use crate::source::{AwaitableSource, Registration, SourceKind};
use crate::tracing_compat::trace;
use crate::transfer::{Delivered, Transfer};
use parking_lot::Mutex;
use std::future::IntoFuture;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

/// Adapter over anything [`Bindable`].
pub struct SubscriptionSource<D, A, R> {
    source: D,
    args: Arc<Mutex<Option<A>>>,
    _signature: PhantomData<fn(A) -> R>,
}

impl<D, A, R> SubscriptionSource<D, A, R> {
    /// Subscribes to `source` when awaited.
    pub fn new(source: D) -> Self {
        Self {
            source,
            args: Arc::new(Mutex::new(None)),
            _signature: PhantomData,
        }
    }
}

impl<D, A, R> std::fmt::Debug for SubscriptionSource<D, A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSource")
            .field("delivered", &self.args.lock().is_some())
            .finish_non_exhaustive()
    }
}

struct SubscriptionRegistration {
    binding: Binding,
    continuation: Weak<Mutex<Option<Continuation>>>,
}

impl Registration for SubscriptionRegistration {
    fn unregister(self: Box<Self>) {
        if let Some(slot) = self.continuation.upgrade() {
            let continuation = slot.lock().take();
            drop(continuation);
        }
        if !self.binding.unbind() {
            trace!("subscription binding was already removed");
        }
    }
}

impl<D, A, R> AwaitableSource for SubscriptionSource<D, A, R>
where
    D: Bindable<A, R>,
    A: Send + 'static,
    R: Default + 'static,
{
    type Output = A;

    fn kind(&self) -> SourceKind {
        SourceKind::Subscription
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn transfer(&self) -> Option<Transfer> {
        Some(Transfer::select(true, false))
    }

    fn try_take_fast_path(&mut self) -> Option<Result<A>> {
        None
    }

    fn register(&mut self, continuation: Continuation) -> Result<Box<dyn Registration>> {
        let slot = Arc::new(Mutex::new(Some(continuation)));
        let weak_slot = Arc::downgrade(&slot);
        let handler: Handler<A, R> = {
            let args_cell = Arc::clone(&self.args);
            Arc::new(move |args: A| {
                let continuation = slot.lock().take();
                if let Some(continuation) = continuation {
                    let args_cell = Arc::clone(&args_cell);
                    continuation.resume_with(move || {
                        *args_cell.lock() = Some(args);
                    });
                } else {
                    trace!("stale subscription invoked after unbind; ignored");
                }
                R::default()
            })
        };
        let binding = self.source.bind(handler)?;
        Ok(Box::new(SubscriptionRegistration {
            binding,
            continuation: weak_slot,
        }))
    }

    fn take_resolved(&mut self) -> Result<A> {
        let args = self.args.lock().take();
        let args = args.ok_or_else(|| Error::internal("subscription resumed without arguments"))?;
        Delivered::moved(args).into_value()
    }
}

impl<'a, A, R> IntoFuture for &'a Delegate<A, R>
where
    A: Send + 'static,
    R: Default + 'static,
{
    type Output = Result<A>;
    type IntoFuture = Suspension<SubscriptionSource<Delegate<A, R>, A, R>>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(SubscriptionSource::new(self.clone()))
    }
}

impl<'a, A> IntoFuture for &'a MulticastDelegate<A>
where
    A: Send + 'static,
{
    type Output = Result<A>;
    type IntoFuture = Suspension<SubscriptionSource<MulticastDelegate<A>, A, ()>>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(SubscriptionSource::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coroutine;
    use crate::host::RefArg;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegate wrapper counting binds and unbinds.
    #[derive(Clone, Default)]
    struct CountingDelegate {
        inner: Delegate<u32, bool>,
        binds: Arc<AtomicUsize>,
        unbinds: Arc<AtomicUsize>,
        kept: Arc<Mutex<Option<Handler<u32, bool>>>>,
    }

    impl Bindable<u32, bool> for CountingDelegate {
        fn bind(&self, handler: Handler<u32, bool>) -> Result<Binding> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            *self.kept.lock() = Some(Arc::clone(&handler));
            let inner = self.inner.bind(handler)?;
            let unbinds = Arc::clone(&self.unbinds);
            Ok(Binding::new(inner.id(), move |_| {
                unbinds.fetch_add(1, Ordering::SeqCst);
                inner.unbind()
            }))
        }
    }

    #[test]
    fn invocation_resumes_inline_and_returns_default() {
        init_test_logging();
        let delegate: Delegate<(String, bool, RefArg<i32>), u8> = Delegate::new();
        let co = Coroutine::spawn({
            let delegate = delegate.clone();
            async move {
                let (name, flag, out) = (&delegate).await?;
                out.set(1);
                Ok::<_, Error>((name, flag))
            }
        });
        assert!(delegate.is_bound());

        let out = RefArg::new(0);
        let returned = delegate.execute((String::from("Name"), true, out.clone()));
        assert_eq!(returned, Some(0));
        assert_eq!(out.get(), 1);
        assert!(!delegate.is_bound());
        let (name, flag) = co.join().expect("done").expect("args");
        assert_eq!(name, "Name");
        assert!(flag);
    }

    #[test]
    fn natural_invocation_unbinds_exactly_once() {
        init_test_logging();
        let delegate = CountingDelegate::default();
        let co = Coroutine::spawn({
            let delegate = delegate.clone();
            async move { Suspension::new(SubscriptionSource::<_, u32, bool>::new(delegate)).await }
        });
        assert_eq!(delegate.inner.execute(7), Some(false));
        assert_eq!(co.join().expect("done").expect("args"), 7);
        assert_eq!(delegate.binds.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.unbinds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_unbinds_exactly_once_and_ignores_stale_copy() {
        init_test_logging();
        let delegate = CountingDelegate::default();
        let co = Coroutine::spawn({
            let delegate = delegate.clone();
            async move { Suspension::new(SubscriptionSource::<_, u32, bool>::new(delegate)).await }
        });
        co.cancel();
        assert!(co.is_cancelled());
        assert_eq!(delegate.unbinds.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.inner.execute(1), None);

        let stale = delegate.kept.lock().take().expect("handler kept");
        assert!(!stale(2));
        assert_eq!(delegate.unbinds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rebinding_a_single_cast_delegate_abandons_the_first_awaiter() {
        init_test_logging();
        let delegate: Delegate<u32> = Delegate::new();
        let first = Coroutine::spawn({
            let delegate = delegate.clone();
            async move { (&delegate).await }
        });
        assert!(!first.is_done());

        let second = Coroutine::spawn({
            let delegate = delegate.clone();
            async move { (&delegate).await }
        });
        assert!(first.is_done(), "replaced handler must release the first awaiter");
        let err = first.join().expect("done").expect_err("abandoned");
        assert_eq!(err.kind(), crate::error::ErrorKind::SourceAbandoned);

        assert_eq!(delegate.execute(5), Some(()));
        assert_eq!(second.join().expect("done").expect("args"), 5);
        assert!(!delegate.is_bound());
    }

    #[test]
    fn clearing_the_delegate_abandons_the_awaiter() {
        init_test_logging();
        let delegate: Delegate<u32, bool> = Delegate::new();
        let co = Coroutine::spawn({
            let delegate = delegate.clone();
            async move { (&delegate).await }
        });
        assert!(delegate.clear());
        let err = co.join().expect("done").expect_err("abandoned");
        assert_eq!(err.kind(), crate::error::ErrorKind::SourceAbandoned);
    }

    #[test]
    fn multicast_resumes_one_awaiter_per_subscription() {
        init_test_logging();
        let delegate: MulticastDelegate<u32> = MulticastDelegate::new();
        let co = Coroutine::spawn({
            let delegate = delegate.clone();
            async move {
                let first = (&delegate).await?;
                let second = (&delegate).await?;
                Ok::<_, Error>(first + second)
            }
        });
        assert_eq!(delegate.len(), 1);
        delegate.broadcast(2);
        assert_eq!(delegate.len(), 1);
        delegate.broadcast(3);
        assert!(delegate.is_empty());
        assert_eq!(co.join().expect("done").expect("sum"), 5);
    }
}
