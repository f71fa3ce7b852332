use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub type AsyncMutexGuard<'a, T> = tokio::sync::MutexGuard<'a, T>;

/// Asynchronous exclusive lock with cancellable, FIFO-fair acquisition.
///
/// Waiters are granted the lock in the order they started waiting. A waiter
/// whose token fires is removed from the wait list and never holds the lock.
/// The returned guard releases the lock exactly once, on drop.
#[derive(Debug, Default)]
pub struct AsyncMutex<T> {
    inner: tokio::sync::Mutex<T>,
}

impl<T> AsyncMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(value),
        }
    }

    /// Waits for the lock.
    ///
    /// # Errors
    ///
    /// Returns a `Cancelled` error if `cancel` fires before the lock is granted.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<AsyncMutexGuard<'_, T>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::cancelled()),
            guard = self.inner.lock() => Ok(guard),
        }
    }

    /// Takes the lock only if nobody holds it and nobody is queued for it.
    pub fn try_acquire(&self) -> Option<AsyncMutexGuard<'_, T>> {
        self.inner.try_lock().ok()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn test_exclusive() {
        let mutex = Arc::new(AsyncMutex::new(()));
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..16 {
            let mutex = mutex.clone();
            let holders = holders.clone();
            let max_holders = max_holders.clone();
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                let _guard = mutex.acquire(&token).await.unwrap();
                let now = holders.fetch_add(1, Ordering::AcqRel) + 1;
                max_holders.fetch_max(now, Ordering::AcqRel);
                tokio::time::sleep(Duration::from_millis(2)).await;
                holders.fetch_sub(1, Ordering::AcqRel);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_holders.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_fifo_grant_order() {
        let mutex = Arc::new(AsyncMutex::new(Vec::new()));
        let token = CancellationToken::new();
        let guard = mutex.acquire(&token).await.unwrap();

        let mut handles = vec![];
        for i in 0..5 {
            let mutex = mutex.clone();
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                mutex.acquire(&token).await.unwrap().push(i);
            }));
            // make sure waiter `i` is queued before waiter `i + 1`.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(guard);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*mutex.acquire(&token).await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_never_acquires() {
        let mutex = Arc::new(AsyncMutex::new(0u32));
        let token = CancellationToken::new();
        let guard = mutex.acquire(&token).await.unwrap();

        let waiter_token = CancellationToken::new();
        let handle = tokio::spawn({
            let mutex = mutex.clone();
            let waiter_token = waiter_token.clone();
            async move {
                let mut guard = mutex.acquire(&waiter_token).await?;
                *guard += 1;
                Ok::<_, Error>(())
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_token.cancel();
        assert!(handle.await.unwrap().unwrap_err().is_cancelled());

        drop(guard);
        let guard = mutex.try_acquire().unwrap();
        assert_eq!(*guard, 0);
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let mutex = AsyncMutex::new(());
        let token = CancellationToken::new();
        token.cancel();
        assert!(mutex.acquire(&token).await.unwrap_err().is_cancelled());
        assert!(mutex.try_acquire().is_some());
    }
}
