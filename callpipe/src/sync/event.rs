use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, join_all},
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{Error, ErrorKind, Result};

type Handler<A> = Arc<dyn Fn(A, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Identifies a registered handler so it can be removed again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A broadcastable event whose handlers receive a clone of the broadcast
/// arguments.
///
/// `broadcast` runs against a snapshot of the handlers taken under a short
/// lock: handlers removed while a broadcast is running still finish for that
/// broadcast, handlers added after the snapshot are not invoked by it.
pub struct AsyncEventArgs<A> {
    handlers: Mutex<Vec<(HandlerId, Handler<A>)>>,
    next_id: AtomicU64,
}

impl<A> Default for AsyncEventArgs<A> {
    fn default() -> Self {
        Self {
            handlers: Mutex::default(),
            next_id: AtomicU64::default(),
        }
    }
}

impl<A: Clone + Send + 'static> AsyncEventArgs<A> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler<A> = Arc::new(move |args, token| handler(args, token).boxed());
        self.handlers.lock().push((id, handler));
        id
    }

    /// Returns false if the handler was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every registered handler concurrently and waits for all of them.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fired before the snapshot was taken, or
    /// an `Aggregate` error listing every handler failure.
    pub async fn broadcast(&self, args: A, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }

        let snapshot: Vec<Handler<A>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        if snapshot.is_empty() {
            return Ok(());
        }

        let results = join_all(
            snapshot
                .iter()
                .map(|handler| handler(args.clone(), cancel.clone())),
        )
        .await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Aggregate, failures.join("; ")))
        }
    }
}

impl<A> std::fmt::Debug for AsyncEventArgs<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEventArgs")
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

/// A broadcastable event whose handlers take no arguments.
#[derive(Debug, Default)]
pub struct AsyncEvent(AsyncEventArgs<()>);

impl AsyncEvent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.0.add(move |(), token| handler(token))
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        self.0.remove(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// # Errors
    ///
    /// See [`AsyncEventArgs::broadcast`].
    pub async fn broadcast(&self, cancel: &CancellationToken) -> Result<()> {
        self.0.broadcast((), cancel).await
    }
}
