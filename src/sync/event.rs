//! An awaitable event with auto- or manual-reset semantics.

use crate::coordinator::{Continuation, Suspension};
use crate::error::Result;
use crate::source::{AwaitableSource, Redeemed, Registration, SourceKind};
use crate::tracing_compat::trace;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Weak};

/// How a triggered event behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Triggering releases one awaiter, or lets the next await through if
    /// nobody is waiting.
    AutoReset,
    /// Triggering sets the event and releases every awaiter until
    /// [`reset`](AwaitableEvent::reset).
    ManualReset,
}

struct EventState {
    active: bool,
    waiters: VecDeque<(u64, Continuation)>,
    next_waiter: u64,
}

struct EventInner {
    mode: EventMode,
    state: Mutex<EventState>,
}

/// Event that coroutines await with `(&event).await`.
///
/// Awaiters are released most-recent-first. Clones share the event.
#[derive(Clone)]
pub struct AwaitableEvent {
    inner: Arc<EventInner>,
}

impl AwaitableEvent {
    /// Creates an event, initially set if `active`.
    #[must_use]
    pub fn new(mode: EventMode, active: bool) -> Self {
        Self {
            inner: Arc::new(EventInner {
                mode,
                state: Mutex::new(EventState {
                    active,
                    waiters: VecDeque::new(),
                    next_waiter: 0,
                }),
            }),
        }
    }

    /// Triggers the event, resuming awaiters on this thread.
    pub fn trigger(&self) {
        let mut state = self.inner.state.lock();
        match self.inner.mode {
            EventMode::ManualReset => {
                state.active = true;
                let waiters = std::mem::take(&mut state.waiters);
                drop(state);
                trace!(waiters = waiters.len(), "manual-reset event triggered");
                for (_, waiter) in waiters {
                    waiter.resume();
                }
            }
            EventMode::AutoReset => loop {
                let Some((_, waiter)) = state.waiters.pop_front() else {
                    state.active = true;
                    return;
                };
                drop(state);
                if waiter.resume() {
                    return;
                }
                trace!("skipping auto-reset waiter that lost to cancellation");
                state = self.inner.state.lock();
            },
        }
    }

    /// Clears the event.
    pub fn reset(&self) {
        self.inner.state.lock().active = false;
    }

    /// Returns true while the event is set.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Returns true for a manual-reset event.
    #[must_use]
    pub fn is_manual_reset(&self) -> bool {
        self.inner.mode == EventMode::ManualReset
    }

    /// Number of coroutines suspended on the event.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Consumes the set state if it is set. An auto-reset event clears.
    fn try_pass(&self, state: &mut EventState) -> bool {
        let passed = state.active;
        if self.inner.mode == EventMode::AutoReset {
            state.active = false;
        }
        passed
    }
}

impl fmt::Debug for AwaitableEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AwaitableEvent")
            .field("mode", &self.inner.mode)
            .field("active", &state.active)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

struct EventRegistration {
    inner: Weak<EventInner>,
    key: u64,
}

impl Registration for EventRegistration {
    fn unregister(self: Box<Self>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let removed = {
            let mut state = inner.state.lock();
            state
                .waiters
                .iter()
                .position(|(key, _)| *key == self.key)
                .and_then(|index| state.waiters.remove(index))
        };
        drop(removed);
    }
}

/// Adapter over an [`AwaitableEvent`].
#[derive(Debug)]
pub struct EventSource {
    event: AwaitableEvent,
}

impl AwaitableSource for EventSource {
    type Output = ();

    fn kind(&self) -> SourceKind {
        SourceKind::Event
    }

    fn is_ready(&self) -> bool {
        self.event.is_active()
    }

    fn try_take_fast_path(&mut self) -> Option<Result<()>> {
        let mut state = self.event.inner.state.lock();
        self.event.try_pass(&mut state).then_some(Ok(()))
    }

    fn register(&mut self, continuation: Continuation) -> Result<Box<dyn Registration>> {
        let mut state = self.event.inner.state.lock();
        if self.event.try_pass(&mut state) {
            drop(state);
            continuation.resume();
            return Ok(Box::new(Redeemed));
        }
        let key = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push_front((key, continuation));
        Ok(Box::new(EventRegistration {
            inner: Arc::downgrade(&self.event.inner),
            key,
        }))
    }

    fn take_resolved(&mut self) -> Result<()> {
        Ok(())
    }
}

impl IntoFuture for &AwaitableEvent {
    type Output = Result<()>;
    type IntoFuture = Suspension<EventSource>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(EventSource {
            event: self.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coroutine;
    use crate::test_utils::init_test_logging;

    fn waiter(event: &AwaitableEvent, order: &Arc<Mutex<Vec<u32>>>, tag: u32) -> Coroutine<Result<()>> {
        let event = event.clone();
        let order = Arc::clone(order);
        Coroutine::spawn(async move {
            (&event).await?;
            order.lock().push(tag);
            Ok(())
        })
    }

    #[test]
    fn active_event_takes_fast_path() {
        init_test_logging();
        let event = AwaitableEvent::new(EventMode::ManualReset, true);
        let co = Coroutine::spawn({
            let event = event.clone();
            async move {
                (&event).await?;
                (&event).await
            }
        });
        assert_eq!(co.fast_paths(), 2);
        assert!(co.join().expect("done").is_ok());
        assert!(event.is_active());
    }

    #[test]
    fn auto_reset_releases_one_most_recent_first() {
        init_test_logging();
        let event = AwaitableEvent::new(EventMode::AutoReset, false);
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = waiter(&event, &order, 1);
        let second = waiter(&event, &order, 2);
        assert_eq!(event.waiter_count(), 2);

        event.trigger();
        assert_eq!(*order.lock(), vec![2]);
        assert!(!event.is_active());
        assert!(!first.is_done());

        event.trigger();
        assert_eq!(*order.lock(), vec![2, 1]);
        assert!(second.is_done());

        event.trigger();
        assert!(event.is_active());
        let late = waiter(&event, &order, 3);
        assert!(late.is_done());
        assert!(!event.is_active());
    }

    #[test]
    fn manual_reset_releases_everyone_until_reset() {
        init_test_logging();
        let event = AwaitableEvent::new(EventMode::ManualReset, false);
        assert!(event.is_manual_reset());
        let order = Arc::new(Mutex::new(Vec::new()));
        let coroutines: Vec<_> = (1..=3).map(|tag| waiter(&event, &order, tag)).collect();
        event.trigger();
        assert_eq!(*order.lock(), vec![3, 2, 1]);
        assert!(coroutines.iter().all(Coroutine::is_done));

        event.reset();
        let blocked = waiter(&event, &order, 4);
        assert!(!blocked.is_done());
        blocked.cancel();
        assert_eq!(event.waiter_count(), 0);
    }

    #[test]
    fn cancelled_waiter_is_skipped() {
        init_test_logging();
        let event = AwaitableEvent::new(EventMode::AutoReset, false);
        let order = Arc::new(Mutex::new(Vec::new()));
        let kept = waiter(&event, &order, 1);
        let cancelled = waiter(&event, &order, 2);
        cancelled.cancel();
        assert_eq!(event.waiter_count(), 1);
        event.trigger();
        assert_eq!(*order.lock(), vec![1]);
        assert!(kept.is_done());
        assert!(cancelled.is_cancelled());
    }
}
