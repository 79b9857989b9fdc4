//! Coadapt: await heterogeneous asynchronous sources from one coroutine protocol.
//!
//! # Overview
//!
//! A coroutine here is any `Future + Send + 'static` driven by [`Coroutine`].
//! Inside its body, single-shot values, retained-result tasks, delegate
//! subscriptions and other coroutines are all awaited directly with `.await`;
//! no awaiter object is ever built at the call site.
//!
//! # Core Guarantees
//!
//! - **Fast path**: an already-resolved source never suspends the coroutine
//! - **Single consumer**: natural completion and cancellation race on one atomic
//!   flag; exactly one of them proceeds
//! - **Exactly-once unregister**: every registration is redeemed once, by the
//!   completing thread, the cancelling thread, or the unwinding frame
//! - **Affinity**: a pinned coroutine only ever runs on its thread; foreign
//!   resumptions are posted there
//! - **Bounded references**: leased results expire at the coroutine's next
//!   suspension
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, cancellation reasons, outcomes
//! - [`error`]: error kinds and the crate `Result`
//! - [`cancel`]: the tri-state cancellation token
//! - [`transfer`]: move/copy/lease policy for delivered values
//! - [`source`]: the awaitable source interface and its adapters
//! - [`coordinator`]: coroutine driver, pending awaits, continuations
//! - [`affinity`]: thread affinity enforcement
//! - [`host`]: host primitives (thread queues, worker pool, promises, tasks, delegates)
//! - [`sync`]: awaitable event and semaphore
//! - [`config`]: host configuration with env and file overrides

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod affinity;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod source;
pub mod sync;
pub mod tracing_compat;
pub mod transfer;
pub mod types;

mod shim;

#[cfg(test)]
pub(crate) mod test_utils;

pub use affinity::{Affinity, Dispatch, Job, PostTarget, ThreadDescriptor};
pub use cancel::{CancelState, CancelToken};
pub use config::{ConfigError, HostConfig};
pub use coordinator::{
    cancel_requested, current_coroutine, non_cancelable, Continuation, Coroutine,
    CoroutineBuilder, NonCancelable, Suspension,
};
pub use error::{Error, ErrorCategory, ErrorKind, Result, ResultExt};
pub use host::{
    promise, Bindable, Binding, BindingId, Delegate, Handler, MulticastDelegate, Promise, RefArg,
    SingleShot, Task, TaskCompleter, ThreadQueue, WorkerPool,
};
pub use source::thread::ThreadSwitch;
pub use source::{AwaitableSource, Registration, SourceKind};
pub use sync::{AwaitableEvent, AwaitableSemaphore, EventMode, SemaphorePermit};
pub use transfer::{Delivered, Lease, Transfer};
pub use types::{CancelKind, CancelReason, CoroutineId, Outcome, PanicPayload};
