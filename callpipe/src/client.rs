use std::{
    marker::PhantomData,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    CallShape, Error, ErrorKind, Metadata, Method, Result, Status,
    msg::{CallRequest, Envelope, FrameBuilder},
    sync::AsyncMutex,
    transport::{FrameReader, FrameWriter, TransportFactory, split},
};

/// Upper bound for delivering a `RequestCancel` to the server.
const CANCEL_SEND_TIMEOUT: Duration = Duration::from_millis(200);

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Default call deadline, measured from the start of the call.
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides `ClientConfig::timeout`.
    pub timeout: Option<Duration>,
    pub headers: Metadata,
    /// Cancelling this token sends `RequestCancel` and fails pending reads.
    pub cancellation: CancellationToken,
}

impl CallOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Opens one connection per call on `addr`.
#[derive(Debug)]
pub struct Client<F> {
    factory: F,
    addr: SocketAddr,
    config: ClientConfig,
}

impl<F: TransportFactory> Client<F> {
    pub fn new(factory: F, addr: SocketAddr, config: ClientConfig) -> Self {
        Self {
            factory,
            addr,
            config,
        }
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connects and sends the call request frame, leaving both directions of
    /// the call to the caller.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailed` or `Timeout` if no connection could be made in
    /// time, and the write error if the call request could not be sent.
    pub async fn start_call<Req, Rsp>(
        &self,
        method: Method,
        options: CallOptions,
    ) -> Result<(RequestSender<Req>, ResponseReceiver<Rsp>)>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let CallOptions {
            timeout,
            headers,
            cancellation,
        } = options;
        let timeout = timeout.unwrap_or(self.config.timeout);
        let deadline = Instant::now().checked_add(timeout);

        let connect = self.factory.connect(self.addr, &cancellation);
        let stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("connect to {} timed out", self.addr),
                ));
            }
        };
        let (reader, mut writer) = split(stream);

        let mut request = CallRequest::new(method.name).with_headers(headers);
        if let Some(at) = SystemTime::now().checked_add(timeout) {
            request = request.with_deadline(at);
        }
        writer.write(&request, &cancellation).await?;
        tracing::trace!("call {} started on {}", method.name, self.addr);

        let writer = Arc::new(AsyncMutex::new(writer));
        let sender = RequestSender {
            method,
            writer: writer.clone(),
            cancel: cancellation.clone(),
            _phantom: PhantomData,
        };
        let receiver = ResponseReceiver {
            method,
            reader,
            writer,
            deadline,
            cancel: cancellation,
            status: None,
            trailers: Metadata::default(),
            _phantom: PhantomData,
        };
        Ok((sender, receiver))
    }

    /// # Errors
    ///
    /// Returns the call status as an `ErrorKind::Status` error when it is not
    /// `Ok`, or the transport error that ended the call.
    pub async fn unary<Req, Rsp>(&self, method: Method, request: &Req, options: CallOptions) -> Result<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        check_shape(method, CallShape::Unary)?;
        let (sender, receiver) = self.start_call(method, options).await?;
        sender.send(request).await?;
        receiver.single().await
    }

    /// Sends `request` and returns the receiver of the response stream.
    ///
    /// # Errors
    ///
    /// See [`start_call`](Self::start_call).
    pub async fn server_streaming<Req, Rsp>(
        &self,
        method: Method,
        request: &Req,
        options: CallOptions,
    ) -> Result<ResponseReceiver<Rsp>>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        check_shape(method, CallShape::ServerStreaming)?;
        let (sender, receiver) = self.start_call(method, options).await?;
        sender.send(request).await?;
        Ok(receiver)
    }

    /// Sends every request, completes the request stream and waits for the
    /// single response.
    ///
    /// # Errors
    ///
    /// Same as [`unary`](Self::unary).
    pub async fn client_streaming<Req, Rsp, I>(
        &self,
        method: Method,
        requests: I,
        options: CallOptions,
    ) -> Result<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
        I: IntoIterator<Item = Req>,
    {
        check_shape(method, CallShape::ClientStreaming)?;
        let (sender, receiver) = self.start_call(method, options).await?;
        for request in requests {
            sender.send(&request).await?;
        }
        sender.complete().await?;
        receiver.single().await
    }

    /// # Errors
    ///
    /// See [`start_call`](Self::start_call).
    pub async fn duplex_streaming<Req, Rsp>(
        &self,
        method: Method,
        options: CallOptions,
    ) -> Result<(RequestSender<Req>, ResponseReceiver<Rsp>)>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        check_shape(method, CallShape::DuplexStreaming)?;
        self.start_call(method, options).await
    }
}

fn check_shape(method: Method, shape: CallShape) -> Result<()> {
    if method.shape == shape {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("{} is {:?}, not {shape:?}", method.name, method.shape),
        ))
    }
}

async fn send_cancel(writer: &AsyncMutex<FrameWriter>) {
    let token = CancellationToken::new();
    let send = async {
        let mut writer = writer.acquire(&token).await?;
        writer.write(&Envelope::RequestCancel, &token).await
    };
    match tokio::time::timeout(CANCEL_SEND_TIMEOUT, send).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("failed to send cancel: {e}"),
        Err(_) => tracing::debug!("sending cancel timed out"),
    }
}

/// Request half of a client call.
pub struct RequestSender<Req> {
    method: Method,
    writer: Arc<AsyncMutex<FrameWriter>>,
    cancel: CancellationToken,
    _phantom: PhantomData<fn(&Req)>,
}

impl<Req: Serialize> RequestSender<Req> {
    /// Writes one `RequestData` envelope plus its payload.
    ///
    /// # Errors
    ///
    /// Returns `SerializeFailed` if `request` does not encode, `Cancelled` if
    /// the call was cancelled, or the transport error.
    pub async fn send(&self, request: &Req) -> Result<()> {
        let payload = self.method.encoding.encode(request)?;
        let mut frames = FrameBuilder::new();
        frames.control(&Envelope::RequestData)?.blob(&payload)?;
        let mut writer = self.writer.acquire(&self.cancel).await?;
        writer.write_frames(frames.finish(), &self.cancel).await
    }

    /// Tells the server no more requests follow.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the call was cancelled, or the transport error.
    pub async fn complete(&self) -> Result<()> {
        let mut writer = self.writer.acquire(&self.cancel).await?;
        writer.write(&Envelope::RequestComplete, &self.cancel).await
    }

    /// Cancels the call locally and asks the server to stop it.
    pub async fn cancel(&self) {
        self.cancel.cancel();
        send_cancel(&self.writer).await;
    }
}

impl<Req> std::fmt::Debug for RequestSender<Req> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSender")
            .field("method", &self.method.name)
            .finish()
    }
}

/// Response half of a client call.
pub struct ResponseReceiver<Rsp> {
    method: Method,
    reader: FrameReader,
    writer: Arc<AsyncMutex<FrameWriter>>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    status: Option<Status>,
    trailers: Metadata,
    _phantom: PhantomData<fn() -> Rsp>,
}

impl<Rsp: DeserializeOwned> ResponseReceiver<Rsp> {
    /// Returns the next response, or `None` once an `Ok` status arrived.
    ///
    /// # Errors
    ///
    /// Returns an `ErrorKind::Status` error for a non-`Ok` status, `Timeout`
    /// when the call deadline passes and `Cancelled` when the call token
    /// fires. The last two also send `RequestCancel` to the server.
    pub async fn message(&mut self) -> Result<Option<Rsp>> {
        if let Some(status) = &self.status {
            return status.clone().into_result().map(|()| None);
        }

        let read = bounded(self.deadline, self.reader.read_expected(&self.cancel)).await;
        match cancel_on_abort(read, &self.cancel, &self.writer).await? {
            Envelope::ResponseData => {
                let read = bounded(self.deadline, self.reader.read_blob(&self.cancel)).await;
                let payload = cancel_on_abort(read, &self.cancel, &self.writer).await?;
                self.method.encoding.decode(&payload).map(Some)
            }
            Envelope::ResponseComplete(complete) => {
                let status = complete.status();
                tracing::trace!("call {} finished: {status}", self.method.name);
                self.trailers = complete.trailers.unwrap_or_default();
                self.status = Some(status.clone());
                status.into_result().map(|()| None)
            }
            envelope => Err(Error::new(
                ErrorKind::ProtocolError,
                format!("unexpected envelope from server: {envelope:?}"),
            )),
        }
    }

    /// Reads the single response of a non-streaming call and its status.
    ///
    /// # Errors
    ///
    /// Same as [`message`](Self::message), plus `ProtocolError` when the
    /// server sent no response or more than one.
    pub async fn single(mut self) -> Result<Rsp> {
        let Some(response) = self.message().await? else {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("{} completed without a response", self.method.name),
            ));
        };
        if self.message().await?.is_some() {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("{} sent more than one response", self.method.name),
            ));
        }
        Ok(response)
    }

    /// Reads every remaining response until the status.
    ///
    /// # Errors
    ///
    /// Same as [`message`](Self::message).
    pub async fn collect(mut self) -> Result<Vec<Rsp>> {
        let mut responses = Vec::new();
        while let Some(response) = self.message().await? {
            responses.push(response);
        }
        Ok(responses)
    }

    /// The final status, once received.
    #[must_use]
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Trailing metadata of the final status.
    #[must_use]
    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }
}

async fn bounded<T>(deadline: Option<Instant>, read: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, read)
            .await
            .unwrap_or_else(|_| Err(Error::new(ErrorKind::Timeout, "call deadline exceeded".into()))),
        None => read.await,
    }
}

/// A read that gave up on the call tells the server to stop it too.
async fn cancel_on_abort<T>(
    read: Result<T>,
    cancel: &CancellationToken,
    writer: &AsyncMutex<FrameWriter>,
) -> Result<T> {
    if let Err(e) = &read
        && (e.is_cancelled() || e.kind == ErrorKind::Timeout)
    {
        cancel.cancel();
        send_cancel(writer).await;
    }
    read
}

impl<Rsp> std::fmt::Debug for ResponseReceiver<Rsp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseReceiver")
            .field("method", &self.method.name)
            .field("reader", &self.reader)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));

        let config: ClientConfig = serde_json::from_str(r#"{"timeout": "250ms"}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_call_options() {
        let token = CancellationToken::new();
        let options = CallOptions::default()
            .with_timeout(Duration::from_secs(2))
            .with_header("X-Trace", "abc")
            .with_cancellation(token.clone());
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.headers.get_text("x-trace"), Some("abc"));
        token.cancel();
        assert!(options.cancellation.is_cancelled());
    }

    #[test]
    fn test_check_shape() {
        check_shape(Method::unary("a/B"), CallShape::Unary).unwrap();
        let err = check_shape(Method::unary("a/B"), CallShape::DuplexStreaming).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
