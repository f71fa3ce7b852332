use std::{net::SocketAddr, sync::Arc};

use tokio_util::sync::DropGuard;

use crate::{ErrorKind, Result, ServerConfig, State, TaskSupervisor, transport::TransportListener};

pub struct Listener {
    task_supervisor: TaskSupervisor,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            task_supervisor: TaskSupervisor::create(),
        }
    }

    /// Binds `transport` and spawns the accept loop. Every accepted
    /// connection runs its call on its own task.
    ///
    /// # Errors
    ///
    /// Returns the bind error once the retries configured for `AddrInUse`
    /// are exhausted, or immediately for any other bind error.
    pub async fn start_listen<L: TransportListener>(
        &self,
        mut transport: L,
        state: &Arc<State>,
    ) -> Result<SocketAddr> {
        let listener_addr = Self::bind(&mut transport, &state.config).await?;
        let state = state.clone();

        let task_supervisor = self.task_supervisor.start_async_task();
        tokio::spawn(async move {
            tracing::info!("start listening: {listener_addr}");
            let stop = task_supervisor.stop_token();
            loop {
                match transport.accept(&stop).await {
                    Ok((stream, peer)) => {
                        tracing::trace!("accepted connection from {peer}");
                        let connection = task_supervisor.start_async_task();
                        let state = state.clone();
                        tokio::spawn(async move {
                            let _connection = connection;
                            if let Err(e) = state.serve_connection(stream, peer.clone()).await
                                && !e.is_cancelled()
                            {
                                tracing::debug!("connection from {peer} dropped: {e}");
                            }
                        });
                    }
                    Err(e) if e.is_cancelled() => {
                        tracing::info!("stop accept loop");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("accept loop for {listener_addr} failed: {e}");
                        break;
                    }
                }
            }
            transport.close();
        });

        Ok(listener_addr)
    }

    async fn bind<L: TransportListener>(transport: &mut L, config: &ServerConfig) -> Result<SocketAddr> {
        let addr = config.bind_addr();
        let mut attempt = 0;
        loop {
            match transport.listen(addr).await {
                Ok(bound) => return Ok(bound),
                Err(e) if e.kind == ErrorKind::AddrInUse && attempt < config.bind_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "bind {addr} failed: {e}, retry {attempt}/{} in {:?}",
                        config.bind_retries,
                        config.bind_retry_interval
                    );
                    transport.close();
                    tokio::time::sleep(config.bind_retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.task_supervisor.drop_guard()
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }

    /// Accept loop plus open connections.
    #[must_use]
    pub fn running_tasks(&self) -> u64 {
        // the supervisor's own slot is not a task.
        self.task_supervisor.running().saturating_sub(1)
    }
}
