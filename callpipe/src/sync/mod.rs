//! Async coordination primitives used by the call engine.
//!
//! Every blocking operation here takes a [`CancellationToken`] and fails with
//! [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled) once it fires.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

mod cancel;
pub use cancel::{cancellable, race_then_join};

mod mutex;
pub use mutex::{AsyncMutex, AsyncMutexGuard};

mod event;
pub use event::{AsyncEvent, AsyncEventArgs, HandlerId};

mod queue;
pub use queue::AwaitableQueue;

mod terminable_queue;
pub use terminable_queue::{Dequeued, TerminableAwaitableQueue};
