use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;
use futures_util::Stream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{Error, ErrorKind, Result, sync::cancellable};

/// Outcome of [`TerminableAwaitableQueue::try_dequeue`].
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item(T),
    /// The queue was terminated and every buffered item has been consumed.
    Terminated,
}

/// An [`AwaitableQueue`](super::AwaitableQueue) that can be terminated.
///
/// Termination is irreversible. Buffered items are still drained in order;
/// once the queue is empty every dequeue reports termination instead of
/// blocking. The termination permit is handed back on each terminated
/// observation so that all later waiters see it too.
///
/// `enqueue` and `terminate` are expected to be driven by a single producer.
#[derive(Debug)]
pub struct TerminableAwaitableQueue<T> {
    ready: Semaphore,
    queue: SegQueue<T>,
    terminated: AtomicBool,
}

impl<T> Default for TerminableAwaitableQueue<T> {
    fn default() -> Self {
        Self {
            ready: Semaphore::new(0),
            queue: SegQueue::new(),
            terminated: AtomicBool::new(false),
        }
    }
}

impl<T> TerminableAwaitableQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns `QueueTerminated` if the queue was already terminated.
    pub fn enqueue(&self, item: T) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorKind::QueueTerminated,
                "enqueue on a terminated queue".into(),
            ));
        }
        self.queue.push(item);
        self.ready.add_permits(1);
        Ok(())
    }

    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.ready.add_permits(1);
        }
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Number of buffered items. Racy snapshot, only meant for diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Waits for the next item or for termination.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first.
    pub async fn try_dequeue(&self, cancel: &CancellationToken) -> Result<Dequeued<T>> {
        cancellable(cancel, async {
            self.ready
                .acquire()
                .await
                .map_err(|e| Error::new(ErrorKind::InternalBug, e.to_string()))
        })
        .await?
        .forget();

        if let Some(item) = self.queue.pop() {
            Ok(Dequeued::Item(item))
        } else if self.is_terminated() {
            self.ready.add_permits(1);
            Ok(Dequeued::Terminated)
        } else {
            Err(Error::new(
                ErrorKind::InternalBug,
                "dequeue failed to pull item off queue".into(),
            ))
        }
    }

    /// Waits for the next item.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first or once the queue is
    /// terminated and drained.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T> {
        match self.try_dequeue(cancel).await? {
            Dequeued::Item(item) => Ok(item),
            Dequeued::Terminated => Err(Error::new(
                ErrorKind::Cancelled,
                "queue has been terminated".into(),
            )),
        }
    }

    /// Yields items until the queue is terminated and drained or `cancel` fires.
    pub fn stream(&self, cancel: CancellationToken) -> impl Stream<Item = T> + '_ {
        futures_util::stream::unfold(cancel, move |cancel| async move {
            match self.try_dequeue(&cancel).await {
                Ok(Dequeued::Item(item)) => Some((item, cancel)),
                Ok(Dequeued::Terminated) | Err(_) => None,
            }
        })
    }
}
