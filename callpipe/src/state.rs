use std::sync::Arc;

use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    CallSummary, IncomingCall, Result, Router, ServerConfig,
    msg::CallRequest,
    sync::{AsyncEvent, AsyncEventArgs},
    transport::{self, TransportStream},
};

/// Everything a connection needs to run its call.
pub struct State {
    pub router: Router,
    pub config: ServerConfig,
    shutdown: CancellationToken,
    pub(crate) on_call_completed: AsyncEventArgs<CallSummary>,
    pub(crate) on_shutdown: AsyncEvent,
}

impl State {
    /// Returns the state plus a guard that shuts every running call down
    /// when dropped.
    #[must_use]
    pub fn create(router: Router, config: ServerConfig) -> (Arc<Self>, DropGuard) {
        let shutdown = CancellationToken::new();
        let drop_guard = shutdown.clone().drop_guard();
        let state = Arc::new(Self {
            router,
            config,
            shutdown,
            on_call_completed: AsyncEventArgs::new(),
            on_shutdown: AsyncEvent::new(),
        });
        (state, drop_guard)
    }

    /// Cancelled once the server is stopping. Every call is cancelled with it.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Runs the single call carried by `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the call request frame could not be read. Call
    /// failures are reported in the summary instead.
    pub async fn serve_connection<S: TransportStream>(
        &self,
        stream: S,
        peer: String,
    ) -> Result<CallSummary> {
        let (mut reader, writer) = transport::split(stream);
        let request: CallRequest = reader.read_expected(&self.shutdown).await?;
        tracing::trace!("{peer}: call request for {}", request.method);

        let incoming = IncomingCall::new(
            request,
            peer,
            reader,
            writer,
            self.config.status_grace,
            &self.shutdown,
        );
        let summary = self.router.dispatch(incoming).await;

        if let Err(e) = self
            .on_call_completed
            .broadcast(summary.clone(), &CancellationToken::new())
            .await
        {
            tracing::warn!("call completion handlers failed: {e}");
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("router", &self.router)
            .field("config", &self.config)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}
