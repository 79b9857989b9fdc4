//! Host primitives the adapters await.
//!
//! These are the collaborators a coroutine layer sits on top of: thread-bound
//! job queues and a worker pool to resume on, single-shot promises and
//! retained-result tasks to await, and delegates to subscribe to. Each one is
//! awaitable through its adapter in [`source`](crate::source).

pub mod delegate;
pub mod pool;
pub mod queue;
pub mod single_shot;
pub mod task;

pub use delegate::{Bindable, Binding, BindingId, Delegate, Handler, MulticastDelegate, RefArg};
pub use pool::WorkerPool;
pub use queue::ThreadQueue;
pub use single_shot::{promise, Promise, SingleShot};
pub use task::{Task, TaskCompleter};
