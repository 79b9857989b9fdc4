//! Awaitable synchronization primitives.
//!
//! - [`AwaitableEvent`]: auto- or manual-reset event
//! - [`AwaitableSemaphore`]: counting semaphore yielding [`SemaphorePermit`]s
//!
//! Both release their awaiters most-recent-first, on the thread that
//! triggered or unlocked them.

pub mod event;
pub mod semaphore;

pub use event::{AwaitableEvent, EventMode, EventSource};
pub use semaphore::{AwaitableSemaphore, SemaphorePermit, SemaphoreSource};
