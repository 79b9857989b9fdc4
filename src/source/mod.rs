//! The awaitable source interface and its adapters.
//!
//! Every primitive a coroutine can await plugs in through
//! [`AwaitableSource`]. The [`Suspension`](crate::coordinator::Suspension)
//! future drives the protocol: validate, take the fast path if the source is
//! already resolved, otherwise register a [`Continuation`] and suspend.
//!
//! Adapters, one per source kind:
//!
//! - [`future`]: single-shot, destructive values ([`SingleShot`](crate::SingleShot))
//! - [`task`]: retained-result tasks ([`Task`](crate::Task))
//! - [`subscription`]: delegate and multicast subscriptions
//! - [`coroutine`]: awaiting another coroutine
//! - [`thread`]: moving the coroutine to another thread or pool
//!
//! The event and semaphore adapters live next to their primitives in
//! [`sync`](crate::sync).

pub mod coroutine;
pub mod future;
pub mod subscription;
pub mod task;
pub mod thread;

use crate::affinity::ThreadDescriptor;
use crate::coordinator::Continuation;
use crate::error::Result;
use crate::transfer::Transfer;

/// Which adapter is handling an await.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Single-shot destructive value.
    Future,
    /// Retained-result task.
    Task,
    /// Delegate or multicast subscription.
    Subscription,
    /// Another coroutine.
    Coroutine,
    /// Awaitable event.
    Event,
    /// Awaitable semaphore.
    Semaphore,
    /// Thread or pool switch.
    ThreadSwitch,
}

/// Capability contract a host primitive satisfies to be awaitable.
///
/// The coordinator calls these in a fixed order on the awaiting thread:
/// `validate`, then `is_ready` / `try_take_fast_path`, then `register`, and
/// finally `take_resolved` once the continuation has resumed.
pub trait AwaitableSource {
    /// Value produced by the await.
    type Output;

    /// The adapter kind, for diagnostics.
    fn kind(&self) -> SourceKind;

    /// Rejects structurally invalid awaits before anything is registered.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Non-blocking, side-effect-free readiness query.
    fn is_ready(&self) -> bool;

    /// Produces the value immediately if the source is resolved.
    fn try_take_fast_path(&mut self) -> Option<Result<Self::Output>>;

    /// Registers `continuation` with the source.
    ///
    /// Must not block. The source may invoke the continuation from any
    /// thread, including inline from within `register` if it resolved in the
    /// meantime.
    fn register(&mut self, continuation: Continuation) -> Result<Box<dyn Registration>>;

    /// Produces the value after the continuation resumed.
    fn take_resolved(&mut self) -> Result<Self::Output>;

    /// How the value reaches the coroutine; `None` for sources that deliver
    /// nothing but the resumption itself.
    fn transfer(&self) -> Option<Transfer> {
        None
    }

    /// Thread the resumption must be delivered on, if the source has one.
    fn resume_thread_requirement(&self) -> Option<ThreadDescriptor> {
        None
    }
}

/// Token into a source, redeemed exactly once.
///
/// The coordinator guarantees a single call, from whichever thread won the
/// pending await (completing, cancelling, or registering). Implementations
/// must be callable from any thread and must not block on the awaiting
/// coroutine.
pub trait Registration: Send + 'static {
    /// Removes the registration from the source.
    fn unregister(self: Box<Self>);
}

/// Registration for sources that resolved during `register` and kept
/// nothing to remove.
pub(crate) struct Redeemed;

impl Registration for Redeemed {
    fn unregister(self: Box<Self>) {}
}
