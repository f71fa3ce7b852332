use crossbeam_queue::SegQueue;
use futures_util::Stream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{Error, ErrorKind, Result, sync::cancellable};

/// Unbounded multi-producer multi-consumer queue with async dequeue.
///
/// Every enqueued item adds exactly one permit to `ready`, so a dequeuer that
/// obtained a permit is guaranteed to find an item.
#[derive(Debug)]
pub struct AwaitableQueue<T> {
    ready: Semaphore,
    queue: SegQueue<T>,
}

impl<T> Default for AwaitableQueue<T> {
    fn default() -> Self {
        Self {
            ready: Semaphore::new(0),
            queue: SegQueue::new(),
        }
    }
}

impl<T> AwaitableQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, item: T) {
        self.queue.push(item);
        self.ready.add_permits(1);
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

    /// Waits for the next item in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T> {
        cancellable(cancel, async {
            self.ready
                .acquire()
                .await
                .map_err(|e| Error::new(ErrorKind::InternalBug, e.to_string()))
        })
        .await?
        .forget();
        self.queue.pop().ok_or_else(|| {
            Error::new(
                ErrorKind::InternalBug,
                "dequeue failed to pull item off queue".into(),
            )
        })
    }

    /// Takes the next item only if one is available right now.
    pub fn try_dequeue(&self) -> Option<T> {
        let permit = self.ready.try_acquire().ok()?;
        permit.forget();
        self.queue.pop()
    }

    /// Yields items until `cancel` fires.
    pub fn stream(&self, cancel: CancellationToken) -> impl Stream<Item = T> + '_ {
        futures_util::stream::unfold(cancel, move |cancel| async move {
            let item = self.dequeue(&cancel).await.ok()?;
            Some((item, cancel))
        })
    }
}
