use std::{future::Future, net::SocketAddr};

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    Error, ErrorKind, Payload, Result,
    msg::{FrameBuilder, parse_frame},
    sync::cancellable,
};

/// Any ordered duplex byte stream a call can run on.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> TransportStream for T {}

/// Server side of a transport.
pub trait TransportListener: Send + Sync + 'static {
    type Stream: TransportStream;

    /// Binds to `addr` and returns the address actually bound.
    fn listen(&mut self, addr: SocketAddr) -> impl Future<Output = Result<SocketAddr>> + Send;

    /// Waits for the next connection and returns it with a printable peer name.
    fn accept(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(Self::Stream, String)>> + Send;

    fn close(&mut self);
}

/// Client side of a transport.
pub trait TransportFactory: Send + Sync + 'static {
    type Stream: TransportStream;

    fn connect(
        &self,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// Splits a connection into its framed read and write halves.
pub fn split<S: TransportStream>(stream: S) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    (FrameReader::new(read_half), FrameWriter::new(write_half))
}

pub struct FrameReader {
    stream: Box<dyn AsyncRead + Send + Unpin>,
    buffer: BytesMut,
    interrupted: bool,
}

impl FrameReader {
    pub fn new(stream: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            buffer: BytesMut::with_capacity(8 << 10),
            interrupted: false,
        }
    }

    /// True once the stream failed or was closed by the peer. Nothing more
    /// can be read afterwards.
    #[must_use]
    pub fn has_read_been_interrupted(&self) -> bool {
        self.interrupted
    }

    async fn read_frame(&mut self, cancel: &CancellationToken) -> Result<Bytes> {
        if self.interrupted {
            return Err(Error::new(
                ErrorKind::TransportUnavailable,
                "read after interruption".into(),
            ));
        }
        loop {
            match parse_frame(&mut self.buffer) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    // the stream can no longer be resynchronized.
                    self.interrupted = true;
                    return Err(e);
                }
            }

            let (stream, buffer) = (&mut self.stream, &mut self.buffer);
            let n = cancellable(cancel, async { Ok(stream.read_buf(buffer).await?) }).await;
            match n {
                Ok(0) => {
                    self.interrupted = true;
                    return Err(Error::new(
                        ErrorKind::TransportUnavailable,
                        "connection closed by peer".into(),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    if !e.is_cancelled() {
                        self.interrupted = true;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Reads the next control frame and decodes it as `T`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the frame does not decode as `T`,
    /// `TransportUnavailable` if the connection is gone and `Cancelled` if
    /// `cancel` fires first.
    pub async fn read_expected<T: DeserializeOwned>(&mut self, cancel: &CancellationToken) -> Result<T> {
        let frame = self.read_frame(cancel).await?;
        rmp_serde::from_slice(&frame).map_err(|e| {
            Error::new(
                ErrorKind::ProtocolError,
                format!("unexpected frame for {}: {e}", std::any::type_name::<T>()),
            )
        })
    }

    /// Reads the blob frame that follows a data envelope.
    ///
    /// # Errors
    ///
    /// Same as [`read_expected`](Self::read_expected), minus decoding.
    pub async fn read_blob(&mut self, cancel: &CancellationToken) -> Result<Payload> {
        Ok(self.read_frame(cancel).await?.into())
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("buffered", &self.buffer.len())
            .field("interrupted", &self.interrupted)
            .finish()
    }
}

pub struct FrameWriter {
    stream: Box<dyn AsyncWrite + Send + Unpin>,
    poisoned: bool,
}

impl FrameWriter {
    pub fn new(stream: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            poisoned: false,
        }
    }

    /// # Errors
    ///
    /// See [`write_frames`](Self::write_frames).
    pub async fn write<T: Serialize>(&mut self, value: &T, cancel: &CancellationToken) -> Result<()> {
        let mut frames = FrameBuilder::new();
        frames.control(value)?;
        self.write_frames(frames.finish(), cancel).await
    }

    /// # Errors
    ///
    /// See [`write_frames`](Self::write_frames).
    pub async fn write_blob(&mut self, blob: &[u8], cancel: &CancellationToken) -> Result<()> {
        let mut frames = FrameBuilder::new();
        frames.blob(blob)?;
        self.write_frames(frames.finish(), cancel).await
    }

    /// Writes fully built frames and flushes them.
    ///
    /// A token that fired before the write starts leaves the stream
    /// untouched. Cancellation in the middle of a write leaves a partial
    /// frame behind, so the writer refuses every later write.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires, `TransportUnavailable` if the
    /// peer is gone or an earlier write was torn.
    pub async fn write_frames(&mut self, frames: Bytes, cancel: &CancellationToken) -> Result<()> {
        if self.poisoned {
            return Err(Error::new(
                ErrorKind::TransportUnavailable,
                "an earlier write was interrupted".into(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }

        let stream = &mut self.stream;
        let result = cancellable(cancel, async {
            stream.write_all(&frames).await?;
            stream.flush().await?;
            Ok(())
        })
        .await;
        if result.is_err() {
            self.poisoned = true;
        }
        result.map_err(|e| {
            if e.is_cancelled() || e.is_unavailable() {
                e
            } else {
                Error::new(ErrorKind::SendMsgFailed, e.msg)
            }
        })
    }

    /// Shuts the write direction down. Errors are ignored, the peer may be gone.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::msg::{CallRequest, Envelope};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(64);
        let (mut reader, _) = split(a);
        let (_, mut writer) = split(b);
        let token = CancellationToken::new();

        let send = async {
            writer.write(&CallRequest::new("svc/m"), &token).await.unwrap();
            writer.write(&Envelope::RequestData, &token).await.unwrap();
            writer.write_blob(&[9u8; 300], &token).await.unwrap();
        };
        let recv = async {
            let request: CallRequest = reader.read_expected(&token).await.unwrap();
            let envelope: Envelope = reader.read_expected(&token).await.unwrap();
            let blob = reader.read_blob(&token).await.unwrap();
            (request, envelope, blob)
        };
        let ((), (request, envelope, blob)) = tokio::join!(send, recv);
        assert_eq!(request.method, "svc/m");
        assert_eq!(envelope, Envelope::RequestData);
        assert_eq!(blob.len(), 300);
    }

    #[tokio::test]
    async fn test_unexpected_frame_is_protocol_error() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut reader, _) = split(a);
        let (_, mut writer) = split(b);
        let token = CancellationToken::new();

        writer.write_blob(b"not msgpack at all", &token).await.unwrap();
        let err = reader.read_expected::<Envelope>(&token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError);
        assert!(!reader.has_read_been_interrupted());
    }

    #[tokio::test]
    async fn test_peer_close_interrupts_reader() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut reader, _) = split(a);
        drop(b);
        let token = CancellationToken::new();
        let err = reader.read_blob(&token).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(reader.has_read_been_interrupted());
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_reader_usable() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut reader, _) = split(a);
        let (_, mut writer) = split(b);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        assert!(reader.read_blob(&token).await.unwrap_err().is_cancelled());
        assert!(!reader.has_read_been_interrupted());

        let token = CancellationToken::new();
        writer.write_blob(b"late", &token).await.unwrap();
        assert_eq!(reader.read_blob(&token).await.unwrap().as_slice(), b"late");
    }

    #[tokio::test]
    async fn test_cancelled_write_touches_nothing() {
        let (a, b) = tokio::io::duplex(1024);
        let (_, mut writer) = split(a);
        let (mut reader, _) = split(b);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(writer.write(&Envelope::RequestCancel, &cancelled).await.unwrap_err().is_cancelled());

        let token = CancellationToken::new();
        writer.write(&Envelope::RequestComplete, &token).await.unwrap();
        let envelope: Envelope = reader.read_expected(&token).await.unwrap();
        assert_eq!(envelope, Envelope::RequestComplete);
    }
}
