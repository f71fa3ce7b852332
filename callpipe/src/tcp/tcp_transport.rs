use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{
    Error, ErrorKind, Result,
    sync::cancellable,
    transport::{TransportFactory, TransportListener},
};

/// Plain TCP transport, one connection per call.
///
/// The same value acts as listener on the server and as connection factory
/// on the client. Accepted and connected sockets have `TCP_NODELAY` set.
#[derive(Debug, Default)]
pub struct TcpTransport {
    listener: Option<TcpListener>,
}

impl TcpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }
}

impl TransportListener for TcpTransport {
    type Stream = TcpStream;

    async fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            let e = Error::from(e);
            if e.kind == ErrorKind::AddrInUse {
                e
            } else {
                Error::new(ErrorKind::BindFailed, e.msg)
            }
        })?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::BindFailed, e.to_string()))?;
        self.listener = Some(listener);
        Ok(listener_addr)
    }

    async fn accept(&self, cancel: &CancellationToken) -> Result<(TcpStream, String)> {
        let Some(listener) = &self.listener else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "accept before listen".into(),
            ));
        };
        let (stream, peer) = cancellable(cancel, async { Ok(listener.accept().await?) }).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("set nodelay for {peer} failed: {e}");
        }
        Ok((stream, peer.to_string()))
    }

    fn close(&mut self) {
        self.listener = None;
    }
}

impl TransportFactory for TcpTransport {
    type Stream = TcpStream;

    async fn connect(&self, addr: SocketAddr, cancel: &CancellationToken) -> Result<TcpStream> {
        let stream = cancellable(cancel, async {
            TcpStream::connect(addr)
                .await
                .map_err(|e| Error::new(ErrorKind::ConnectFailed, format!("{addr}: {e}")))
        })
        .await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
