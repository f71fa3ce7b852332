use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Runs `fut` until it completes or `token` fires, whichever happens first.
///
/// A token that has already fired wins over a future that is ready on its
/// first poll, so a cancelled caller never observes a late success.
///
/// # Errors
///
/// Returns a `Cancelled` error if the token fires first, otherwise the
/// future's own result.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Error::cancelled()),
        r = fut => r,
    }
}

/// Drives two futures concurrently; when either finishes `stop` is cancelled
/// and the other one is awaited to completion.
///
/// `stop` is the signal the slower side is expected to observe. Both outputs
/// are always returned, in argument order.
pub async fn race_then_join<A, B>(stop: &CancellationToken, a: A, b: B) -> (A::Output, B::Output)
where
    A: Future,
    B: Future,
{
    tokio::pin!(a);
    tokio::pin!(b);
    tokio::select! {
        ra = &mut a => {
            stop.cancel();
            (ra, b.await)
        }
        rb = &mut b => {
            stop.cancel();
            (a.await, rb)
        }
    }
}
