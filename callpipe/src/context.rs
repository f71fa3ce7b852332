use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    Error, ErrorKind, Metadata, Payload, Result, Status,
    msg::{Envelope, FrameBuilder, ResponseComplete},
    sync::AsyncMutex,
    transport::FrameWriter,
};

struct CallContextInner {
    method: String,
    peer: String,
    deadline: Option<SystemTime>,
    request_headers: Metadata,
    response_trailers: Mutex<Metadata>,
    /// The call's cancellation signal.
    cancel: CancellationToken,
    /// Fires a grace period after the deadline. Parent of `cancel`.
    extended: CancellationToken,
    writer: AsyncMutex<FrameWriter>,
    completed: AtomicBool,
    _watchdog: DropGuard,
}

/// Per-call state shared by the engine and the handler.
///
/// The call is cancelled when the client sends `RequestCancel`, when the
/// connection breaks, when the deadline passes or when the server shuts
/// down. Every frame written back to the client goes through one write lock.
#[derive(Clone)]
pub struct CallContext(Arc<CallContextInner>);

impl CallContext {
    pub(crate) fn new(
        method: String,
        peer: String,
        deadline: Option<SystemTime>,
        request_headers: Metadata,
        writer: FrameWriter,
        status_grace: Duration,
        shutdown: &CancellationToken,
    ) -> Self {
        let extended = CancellationToken::new();
        let cancel = extended.child_token();
        let watchdog = CancellationToken::new();

        tokio::spawn({
            let stop = watchdog.clone();
            let watch = Self::watch(
                deadline.and_then(to_instant),
                status_grace,
                shutdown.clone(),
                cancel.clone(),
                extended.clone(),
            );
            async move {
                tokio::select! {
                    () = stop.cancelled() => {}
                    () = watch => {}
                }
            }
        });

        Self(Arc::new(CallContextInner {
            method,
            peer,
            deadline,
            request_headers,
            response_trailers: Mutex::default(),
            cancel,
            extended,
            writer: AsyncMutex::new(writer),
            completed: AtomicBool::new(false),
            _watchdog: watchdog.drop_guard(),
        }))
    }

    async fn watch(
        deadline: Option<Instant>,
        grace: Duration,
        shutdown: CancellationToken,
        cancel: CancellationToken,
        extended: CancellationToken,
    ) {
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = expired => tracing::debug!("call deadline expired"),
            () = shutdown.cancelled() => {}
            () = cancel.cancelled() => {}
        }
        cancel.cancel();

        if let Some(window_end) = deadline.and_then(|d| d.checked_add(grace)) {
            tokio::time::sleep_until(window_end).await;
            extended.cancel();
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.0.method
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.0.peer
    }

    #[must_use]
    pub fn deadline(&self) -> Option<SystemTime> {
        self.0.deadline
    }

    #[must_use]
    pub fn request_headers(&self) -> &Metadata {
        &self.0.request_headers
    }

    pub fn add_trailer(&self, key: impl Into<String>, value: impl Into<String>) {
        self.0.response_trailers.lock().insert(key, value);
    }

    pub fn add_trailer_bin(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.response_trailers.lock().insert_bin(key, value);
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.0.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.0.cancel.cancel();
    }

    /// True once the final status has been written.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.0.completed.load(Ordering::Acquire)
    }

    fn check_not_completed(&self) -> Result<()> {
        if self.is_completed() {
            Err(Error::new(
                ErrorKind::InvalidArgument,
                "the call has already completed".into(),
            ))
        } else {
            Ok(())
        }
    }

    /// Writes one `ResponseData` envelope and its blob as a single unit.
    pub(crate) async fn write_response(&self, blob: &Payload) -> Result<()> {
        self.check_not_completed()?;
        let mut frames = FrameBuilder::new();
        frames.control(&Envelope::ResponseData)?.blob(blob)?;

        let mut writer = self.0.writer.acquire(&self.0.cancel).await?;
        self.check_not_completed()?;
        writer.write_frames(frames.finish(), &self.0.cancel).await?;
        tracing::trace!("{}: wrote {} response bytes", self.0.method, blob.len());
        Ok(())
    }

    /// Writes the final status. Returns false if the extended deadline
    /// window had already closed and nothing was sent.
    pub(crate) async fn send_status(&self, status: &Status) -> Result<bool> {
        let mut writer = match self.0.writer.acquire(&self.0.extended).await {
            Ok(writer) => writer,
            Err(e) if e.is_cancelled() => return Ok(false),
            Err(e) => return Err(e),
        };
        if self.0.completed.swap(true, Ordering::AcqRel) {
            return Err(Error::new(
                ErrorKind::InternalBug,
                format!("status sent twice for {}", self.0.method),
            ));
        }

        let trailers = std::mem::take(&mut *self.0.response_trailers.lock());
        let envelope = Envelope::ResponseComplete(ResponseComplete::new(status, trailers));
        match writer.write(&envelope, &self.0.extended).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_cancelled() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("method", &self.0.method)
            .field("peer", &self.0.peer)
            .field("deadline", &self.0.deadline)
            .field("cancelled", &self.is_cancelled())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// `None` for deadlines too far away to be represented.
fn to_instant(deadline: SystemTime) -> Option<Instant> {
    let now = Instant::now();
    match deadline.duration_since(SystemTime::now()) {
        Ok(remaining) => now.checked_add(remaining),
        Err(_) => Some(now),
    }
}
