use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    CallSummary, Listener, Result, Router, State,
    sync::{AsyncEvent, AsyncEventArgs},
    transport::TransportListener,
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ServerConfig {
    /// Overrides `loopback_only` and `port` when set.
    #[serde_inline_default(None)]
    pub addr: Option<SocketAddr>,
    #[serde_inline_default(true)]
    pub loopback_only: bool,
    #[serde_inline_default(0)]
    pub port: u16,
    /// Extra bind attempts while the address is still in use.
    #[serde_inline_default(3)]
    pub bind_retries: u32,
    #[serde_inline_default(Duration::from_millis(500))]
    #[serde(with = "humantime_serde")]
    pub bind_retry_interval: Duration,
    /// How long after its deadline a call may still send its status.
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub status_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl ServerConfig {
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        self.addr.unwrap_or_else(|| {
            let ip = if self.loopback_only {
                Ipv4Addr::LOCALHOST
            } else {
                Ipv4Addr::UNSPECIFIED
            };
            SocketAddr::from((ip, self.port))
        })
    }
}

/// Accepts connections and runs one call per connection against a
/// [`Router`].
///
/// ```rust,no_run
/// # use callpipe::{Method, Router, Server, ServerConfig, TcpTransport};
/// # #[tokio::main]
/// # async fn main() -> callpipe::Result<()> {
/// const ECHO: Method = Method::unary("demo/Echo");
///
/// let mut router = Router::default();
/// router.add_unary(ECHO, |_ctx, req: String| async move { Ok(req) });
///
/// let server = Server::create(router, ServerConfig::default());
/// let addr = server.start(TcpTransport::new()).await?;
/// println!("listening on {addr}");
/// server.shutdown().await
/// # }
/// ```
pub struct Server {
    state: Arc<State>,
    listener: Listener,
    _drop_guard: DropGuard,
}

impl Server {
    #[must_use]
    pub fn create(router: Router, config: ServerConfig) -> Self {
        let (state, drop_guard) = State::create(router, config);
        Self {
            state,
            listener: Listener::default(),
            _drop_guard: drop_guard,
        }
    }

    /// Binds `transport` and starts accepting calls. Returns the bound
    /// address, which carries the real port when the configured one is 0.
    ///
    /// # Errors
    ///
    /// Returns the bind error of the transport, after retrying `AddrInUse`
    /// as configured.
    pub async fn start<L: TransportListener>(&self, transport: L) -> Result<SocketAddr> {
        self.listener.start_listen(transport, &self.state).await
    }

    /// Stops accepting connections and cancels every running call. Calls
    /// can still send their status within the grace window.
    pub fn stop(&self) {
        self.listener.stop();
        self.state.stop();
    }

    /// Waits for the accept loop and every connection task. Returns only
    /// after [`stop`](Self::stop).
    pub async fn join(&self) {
        self.listener.join().await;
    }

    /// Stops, joins, then runs the `on_shutdown` handlers.
    ///
    /// # Errors
    ///
    /// Returns an aggregate of the failed shutdown handlers.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop();
        self.join().await;
        tracing::info!("server stopped");
        self.state.on_shutdown.broadcast(&CancellationToken::new()).await
    }

    #[must_use]
    pub fn on_call_completed(&self) -> &AsyncEventArgs<CallSummary> {
        &self.state.on_call_completed
    }

    #[must_use]
    pub fn on_shutdown(&self) -> &AsyncEvent {
        &self.state.on_shutdown
    }

    #[must_use]
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    #[must_use]
    pub fn running_tasks(&self) -> u64 {
        self.listener.running_tasks()
    }
}
