use std::{
    any::Any,
    future::Future,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::{
    CallContext, CallShape, Encoding, Error, ErrorKind, Method, Result, Status, StatusCode,
    msg::{CallRequest, Envelope},
    sync::{Dequeued, TerminableAwaitableQueue, race_then_join},
    transport::{FrameReader, FrameWriter},
};

/// Outcome of one call, reported through `Server::on_call_completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub method: String,
    pub peer: String,
    pub status: Status,
    /// False when the client had gone or the deadline window had closed.
    pub status_sent: bool,
    pub elapsed: Duration,
}

/// A connection whose call request frame has been read but which has not
/// been dispatched to a method yet.
pub struct IncomingCall {
    method: String,
    reader: FrameReader,
    context: CallContext,
    started: Instant,
}

impl IncomingCall {
    #[must_use]
    pub fn new(
        request: CallRequest,
        peer: String,
        reader: FrameReader,
        writer: FrameWriter,
        status_grace: Duration,
        shutdown: &CancellationToken,
    ) -> Self {
        let deadline = request.deadline();
        let context = CallContext::new(
            request.method.clone(),
            peer,
            deadline,
            request.headers.unwrap_or_default(),
            writer,
            status_grace,
            shutdown,
        );
        Self {
            method: request.method,
            reader,
            context,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn context(&self) -> &CallContext {
        &self.context
    }

    /// Ends the call with `status` without running any handler.
    pub async fn reject(mut self, status: Status) -> CallSummary {
        finish(&self.context, &mut self.reader, status, self.started).await
    }
}

impl std::fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("context", &self.context)
            .finish()
    }
}

/// Everything a handler receives.
pub struct CallParts<Req, Rsp> {
    pub context: CallContext,
    /// The single request of `Unary` and `ServerStreaming` calls.
    pub request: Option<Req>,
    pub requests: RequestStream<Req>,
    pub responses: ResponseStream<Rsp>,
}

/// Read side of a request-streaming call.
pub struct RequestStream<Req> {
    shape: CallShape,
    cancel: CancellationToken,
    queue: Arc<TerminableAwaitableQueue<Req>>,
}

impl<Req> RequestStream<Req> {
    /// Next request item, `None` once the client completed its stream.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a call that does not stream requests and
    /// `Cancelled` once the call is cancelled.
    pub async fn next(&self) -> Result<Option<Req>> {
        if !self.shape.streams_requests() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "call does not stream requests".into(),
            ));
        }
        match self.queue.try_dequeue(&self.cancel).await? {
            Dequeued::Item(item) => Ok(Some(item)),
            Dequeued::Terminated => Ok(None),
        }
    }
}

/// Write side of a response-streaming call.
pub struct ResponseStream<Rsp> {
    shape: CallShape,
    encoding: Encoding,
    context: CallContext,
    _rsp: PhantomData<fn(Rsp)>,
}

impl<Rsp: Serialize> ResponseStream<Rsp> {
    /// Sends one response item. The item is serialized before this returns.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a call that does not stream responses or
    /// whose status was already sent, and `Cancelled` once the call is
    /// cancelled.
    pub fn write(&self, response: &Rsp) -> impl Future<Output = Result<()>> + Send + '_ {
        let blob = if self.shape.streams_responses() {
            self.encoding.encode(response)
        } else {
            Err(Error::new(
                ErrorKind::InvalidArgument,
                "call does not stream responses".into(),
            ))
        };
        async move { self.context.write_response(&blob?).await }
    }
}

/// Drives one call of a known method from its first envelope to its status.
pub struct ServerCall<Req, Rsp> {
    method: Method,
    context: CallContext,
    reader: FrameReader,
    requests: Arc<TerminableAwaitableQueue<Req>>,
    started: Instant,
    _rsp: PhantomData<fn(Rsp)>,
}

impl<Req, Rsp> ServerCall<Req, Rsp>
where
    Req: DeserializeOwned + Send + 'static,
    Rsp: Serialize + Send + 'static,
{
    #[must_use]
    pub fn new(method: Method, incoming: IncomingCall) -> Self {
        Self {
            method,
            context: incoming.context,
            reader: incoming.reader,
            requests: Arc::new(TerminableAwaitableQueue::new()),
            started: incoming.started,
            _rsp: PhantomData,
        }
    }

    #[must_use]
    pub fn context(&self) -> &CallContext {
        &self.context
    }

    /// Runs the call to completion with `handler`.
    ///
    /// Non-streaming requests are read and decoded before the handler is
    /// invoked. While the handler runs the client is monitored for further
    /// request items, completion and cancellation. The final status is
    /// always the last frame written.
    pub async fn run<F, Fut>(self, handler: F) -> CallSummary
    where
        F: FnOnce(CallParts<Req, Rsp>) -> Fut,
        Fut: Future<Output = Result<Option<Rsp>>>,
    {
        let Self {
            method,
            context,
            mut reader,
            requests,
            started,
            ..
        } = self;
        tracing::trace!("{}: call from {} started", method.name, context.peer());

        let request = if method.shape.streams_requests() {
            None
        } else {
            match Self::try_read_non_streaming_request(&method, &context, &mut reader).await {
                Ok(Some(request)) => Some(request),
                Ok(None) => {
                    tracing::debug!("{}: cancelled before the request arrived", method.name);
                    return CallSummary {
                        method: method.name.into(),
                        peer: context.peer().into(),
                        status: Status::cancelled(),
                        status_sent: false,
                        elapsed: started.elapsed(),
                    };
                }
                Err(status) => return finish(&context, &mut reader, status, started).await,
            }
        };

        let parts = CallParts {
            context: context.clone(),
            request,
            requests: RequestStream {
                shape: method.shape,
                cancel: context.cancellation_token().clone(),
                queue: requests.clone(),
            },
            responses: ResponseStream {
                shape: method.shape,
                encoding: method.encoding,
                context: context.clone(),
                _rsp: PhantomData,
            },
        };
        let status = Self::invoke_handler_with_client_monitoring(
            &method,
            &context,
            &mut reader,
            &requests,
            async move { handler(parts).await },
        )
        .await;
        finish(&context, &mut reader, status, started).await
    }

    /// Reads the single `RequestData` envelope and its blob.
    ///
    /// `Ok(None)` means the client cancelled or went away, in which case no
    /// frame must be written back.
    async fn try_read_non_streaming_request(
        method: &Method,
        context: &CallContext,
        reader: &mut FrameReader,
    ) -> std::result::Result<Option<Req>, Status> {
        let cancel = context.cancellation_token();
        let read_failed = |e: Error| {
            if e.is_unavailable() {
                context.cancel();
                Ok(None)
            } else if e.is_cancelled() {
                Err(Status::cancelled())
            } else {
                Err(Status::new(StatusCode::Internal, e.to_string()))
            }
        };

        match reader.read_expected::<Envelope>(cancel).await {
            Ok(Envelope::RequestData) => {}
            Ok(Envelope::RequestCancel) => {
                context.cancel();
                return Ok(None);
            }
            Ok(other) => {
                tracing::warn!("{}: expected request data, got {other:?}", method.name);
                return Err(Status::new(
                    StatusCode::Internal,
                    "Client did not send request data.",
                ));
            }
            Err(e) => return read_failed(e),
        }

        let blob = match reader.read_blob(cancel).await {
            Ok(blob) => blob,
            Err(e) => return read_failed(e),
        };
        match method.encoding.decode(&blob) {
            Ok(request) => Ok(Some(request)),
            Err(e) => Err(Status::new(
                StatusCode::Internal,
                format!("failed to deserialize request: {e}"),
            )),
        }
    }

    async fn invoke_handler_with_client_monitoring<Fut>(
        method: &Method,
        context: &CallContext,
        reader: &mut FrameReader,
        requests: &TerminableAwaitableQueue<Req>,
        handler: Fut,
    ) -> Status
    where
        Fut: Future<Output = Result<Option<Rsp>>>,
    {
        let stop = context.cancellation_token().child_token();
        let monitor = Self::monitor(method, context, reader, requests, &stop);
        let execute = async {
            let outcome = AssertUnwindSafe(handler).catch_unwind().await;
            Self::complete(method, context, outcome).await
        };
        let ((), status) = race_then_join(&stop, monitor, execute).await;
        status
    }

    /// Watches the client while the handler runs.
    ///
    /// Every way out of this loop except `stop` cancels the call, so the
    /// handler can never outlive a client that is gone.
    async fn monitor(
        method: &Method,
        context: &CallContext,
        reader: &mut FrameReader,
        requests: &TerminableAwaitableQueue<Req>,
        stop: &CancellationToken,
    ) {
        let streams_requests = method.shape.streams_requests();
        loop {
            let envelope = match reader.read_expected::<Envelope>(stop).await {
                Ok(envelope) => envelope,
                Err(e) => return Self::monitor_failed(method, context, &e),
            };

            match envelope {
                Envelope::RequestCancel => {
                    tracing::debug!("{}: cancelled by client", method.name);
                    context.cancel();
                    return;
                }
                Envelope::RequestComplete if streams_requests => {
                    tracing::trace!("{}: request stream completed", method.name);
                    requests.terminate();
                }
                Envelope::RequestData if streams_requests => {
                    let blob = match reader.read_blob(stop).await {
                        Ok(blob) => blob,
                        Err(e) => return Self::monitor_failed(method, context, &e),
                    };
                    if requests.is_terminated() {
                        tracing::warn!("{}: request data after request complete", method.name);
                        continue;
                    }
                    match method.encoding.decode::<Req>(&blob) {
                        Ok(item) => {
                            if let Err(e) = requests.enqueue(item) {
                                tracing::warn!("{}: {e}", method.name);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("{}: undecodable request item: {e}", method.name);
                            context.cancel();
                            return;
                        }
                    }
                }
                Envelope::RequestData | Envelope::ResponseData => {
                    // the blob frame still follows and must not be read as an envelope.
                    if let Err(e) = reader.read_blob(stop).await {
                        return Self::monitor_failed(method, context, &e);
                    }
                    tracing::warn!("{}: dropping unexpected {envelope:?}", method.name);
                }
                other => tracing::trace!("{}: ignoring {other:?}", method.name),
            }
        }
    }

    fn monitor_failed(method: &Method, context: &CallContext, error: &Error) {
        if error.is_cancelled() {
            return;
        }
        if error.is_unavailable() {
            tracing::debug!("{}: client went away: {error}", method.name);
        } else {
            tracing::warn!("{}: {error}", method.name);
        }
        context.cancel();
    }

    /// Maps the handler outcome to the status to send, writing the single
    /// response of non-streaming calls first.
    async fn complete(
        method: &Method,
        context: &CallContext,
        outcome: std::result::Result<Result<Option<Rsp>>, Box<dyn Any + Send>>,
    ) -> Status {
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!("{}: handler panicked: {msg}", method.name);
                return Status::new(StatusCode::Unknown, msg);
            }
        };

        let streams_responses = method.shape.streams_responses();
        match result {
            Ok(Some(response)) if !streams_responses => {
                if context.is_cancelled() {
                    return Status::cancelled();
                }
                let written = match method.encoding.encode(&response) {
                    Ok(blob) => context.write_response(&blob).await,
                    Err(e) => Err(e),
                };
                match written {
                    Ok(()) => Status::ok(),
                    Err(e) => Status::from_error(&e),
                }
            }
            Ok(Some(_)) => {
                tracing::error!("{}: streaming handler returned a response", method.name);
                Status::internal_error()
            }
            Ok(None) if !streams_responses => {
                tracing::error!("{}: handler returned no response", method.name);
                Status::internal_error()
            }
            Ok(None) => {
                if context.is_cancelled() {
                    Status::cancelled()
                } else {
                    Status::ok()
                }
            }
            Err(e) => {
                tracing::debug!("{}: handler failed: {e}", method.name);
                Status::from_error(&e)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// How long a finished call keeps reading what the client still sends.
const LINGER: Duration = Duration::from_millis(200);

async fn finish(
    context: &CallContext,
    reader: &mut FrameReader,
    status: Status,
    started: Instant,
) -> CallSummary {
    let status_sent = match context.send_status(&status).await {
        Ok(sent) => {
            if !sent {
                tracing::debug!("{}: deadline window closed, dropped {status}", context.method());
            }
            sent
        }
        Err(e) => {
            tracing::debug!("{}: failed to send {status}: {e}", context.method());
            false
        }
    };
    tracing::debug!(
        "{} from {} finished: {status}",
        context.method(),
        context.peer()
    );
    let summary = CallSummary {
        method: context.method().into(),
        peer: context.peer().into(),
        status,
        status_sent,
        elapsed: started.elapsed(),
    };
    if status_sent {
        linger(reader).await;
    }
    summary
}

/// Discards client frames until the client closes or `LINGER` passes.
/// Closing a socket with unread input resets the connection, which can
/// destroy the status before the client read it.
async fn linger(reader: &mut FrameReader) {
    let token = CancellationToken::new();
    let drain = async { while reader.read_blob(&token).await.is_ok() {} };
    let _ = tokio::time::timeout(LINGER, drain).await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{
        msg::ResponseComplete,
        transport::{FrameWriter, split},
    };

    const UNARY: Method = Method::unary("test/Unary");
    const CLIENT_STREAMING: Method = Method::client_streaming("test/Sum");
    const SERVER_STREAMING: Method = Method::server_streaming("test/Count");
    const DUPLEX: Method = Method::duplex_streaming("test/Chat");

    struct Peer {
        reader: FrameReader,
        writer: FrameWriter,
        token: CancellationToken,
    }

    impl Peer {
        async fn send(&mut self, envelope: Envelope) {
            self.writer.write(&envelope, &self.token).await.unwrap();
        }

        async fn send_item<T: Serialize>(&mut self, item: &T) {
            self.send(Envelope::RequestData).await;
            let blob = Encoding::MessagePack.encode(item).unwrap();
            self.writer.write_blob(&blob, &self.token).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            self.reader.read_expected(&self.token).await.unwrap()
        }

        async fn recv_item<T: DeserializeOwned>(&mut self) -> T {
            assert_eq!(self.recv().await, Envelope::ResponseData);
            let blob = self.reader.read_blob(&self.token).await.unwrap();
            Encoding::MessagePack.decode(&blob).unwrap()
        }

        async fn recv_status(&mut self) -> ResponseComplete {
            match self.recv().await {
                Envelope::ResponseComplete(complete) => complete,
                other => panic!("expected status, got {other:?}"),
            }
        }

        async fn expect_closed(&mut self) {
            let err = self.reader.read_blob(&self.token).await.unwrap_err();
            assert!(err.is_unavailable(), "{err}");
        }
    }

    fn new_call<Req, Rsp>(method: Method) -> (ServerCall<Req, Rsp>, Peer)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
    {
        let (server, client) = tokio::io::duplex(1 << 16);
        let (server_reader, server_writer) = split(server);
        let (reader, writer) = split(client);
        let incoming = IncomingCall::new(
            CallRequest::new(method.name),
            "peer".into(),
            server_reader,
            server_writer,
            Duration::from_secs(5),
            &CancellationToken::new(),
        );
        let peer = Peer {
            reader,
            writer,
            token: CancellationToken::new(),
        };
        (ServerCall::new(method, incoming), peer)
    }

    #[tokio::test]
    async fn test_unary_response_then_ok() {
        let (call, mut peer) = new_call::<String, String>(UNARY);
        peer.send_item(&"world".to_string()).await;

        let summary = call
            .run(|parts| async move { Ok(Some(format!("hello {}", parts.request.unwrap()))) })
            .await;
        assert_eq!(summary.status, Status::ok());
        assert!(summary.status_sent);

        assert_eq!(peer.recv_item::<String>().await, "hello world");
        assert_eq!(peer.recv_status().await.status(), Status::ok());
        peer.expect_closed().await;
    }

    #[tokio::test]
    async fn test_unary_cancel_before_data() {
        let (call, mut peer) = new_call::<String, String>(UNARY);
        peer.send(Envelope::RequestCancel).await;

        let invoked = AtomicBool::new(false);
        let flag = &invoked;
        let summary = call
            .run(move |_| async move {
                flag.store(true, Ordering::Release);
                Ok(Some(String::new()))
            })
            .await;
        assert!(!invoked.load(Ordering::Acquire));
        assert_eq!(summary.status.code, StatusCode::Cancelled);
        assert!(!summary.status_sent);
        peer.expect_closed().await;
    }

    #[tokio::test]
    async fn test_unary_without_request_data() {
        let (call, mut peer) = new_call::<String, String>(UNARY);
        peer.send(Envelope::RequestComplete).await;

        let summary = call.run(|_| async { Ok(Some(String::new())) }).await;
        assert_eq!(
            summary.status,
            Status::new(StatusCode::Internal, "Client did not send request data.")
        );
        assert_eq!(peer.recv_status().await.status(), summary.status);
    }

    #[tokio::test]
    async fn test_unary_undecodable_request() {
        let (call, mut peer) = new_call::<u32, u32>(UNARY);
        peer.send_item(&"not a number").await;

        let summary = call.run(|_| async { Ok(Some(0)) }).await;
        assert_eq!(summary.status.code, StatusCode::Internal);
        assert!(summary.status.detail.starts_with("failed to deserialize request"));
        assert_eq!(peer.recv_status().await.status_code, StatusCode::Internal.as_i32());
    }

    #[tokio::test]
    async fn test_client_streaming_three_items() {
        let (call, mut peer) = new_call::<i64, i64>(CLIENT_STREAMING);
        for i in 1..=3 {
            peer.send_item(&i).await;
        }
        peer.send(Envelope::RequestComplete).await;

        let summary = call
            .run(|parts| async move {
                let mut seen = vec![];
                while let Some(item) = parts.requests.next().await? {
                    seen.push(item);
                }
                assert_eq!(seen, vec![1, 2, 3]);
                assert_eq!(parts.requests.next().await?, None);
                Ok(Some(seen.iter().sum()))
            })
            .await;
        assert_eq!(summary.status, Status::ok());
        assert_eq!(peer.recv_item::<i64>().await, 6);
        assert_eq!(peer.recv_status().await.status(), Status::ok());
    }

    #[tokio::test]
    async fn test_duplex_status_is_last() {
        let (call, mut peer) = new_call::<String, String>(DUPLEX);
        peer.send_item(&"one".to_string()).await;

        let summary = call
            .run(|parts| async move {
                let first = parts.requests.next().await?.unwrap();
                parts.responses.write(&format!("{first}-a")).await?;
                parts.responses.write(&format!("{first}-b")).await?;
                Ok(None)
            })
            .await;
        assert_eq!(summary.status, Status::ok());

        assert_eq!(peer.recv_item::<String>().await, "one-a");
        assert_eq!(peer.recv_item::<String>().await, "one-b");
        assert_eq!(peer.recv_status().await.status(), Status::ok());
        peer.expect_closed().await;
    }

    #[tokio::test]
    async fn test_explicit_status_error() {
        let (call, mut peer) = new_call::<String, String>(UNARY);
        peer.send_item(&"k".to_string()).await;

        let summary = call
            .run(|parts| async move {
                parts.context.add_trailer("x-key", "k");
                Err(Error::status(StatusCode::NotFound, "no such key"))
            })
            .await;
        assert_eq!(summary.status, Status::new(StatusCode::NotFound, "no such key"));

        let complete = peer.recv_status().await;
        assert_eq!(complete.status(), summary.status);
        assert_eq!(complete.trailers.unwrap().get_text("x-key"), Some("k"));
    }

    #[tokio::test]
    async fn test_handler_observes_client_cancel() {
        let (call, mut peer) = new_call::<u32, u32>(SERVER_STREAMING);
        peer.send_item(&3u32).await;

        let run = tokio::spawn(call.run(|parts| async move {
            parts.responses.write(&1).await?;
            parts.context.cancellation_token().cancelled().await;
            Err(Error::cancelled())
        }));

        assert_eq!(peer.recv_item::<u32>().await, 1);
        peer.send(Envelope::RequestCancel).await;
        let summary = run.await.unwrap();
        assert_eq!(summary.status, Status::cancelled());
        assert_eq!(peer.recv_status().await.status(), Status::cancelled());
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_handler() {
        let (call, peer) = new_call::<u32, u32>(DUPLEX);
        let run = tokio::spawn(call.run(|parts| async move {
            parts.requests.next().await?;
            Ok(None)
        }));
        drop(peer);
        let summary = run.await.unwrap();
        assert_eq!(summary.status, Status::cancelled());
        assert!(!summary.status_sent);
    }

    #[tokio::test]
    async fn test_outcome_classification() {
        // a streaming call must not return a response.
        let (call, mut peer) = new_call::<u32, u32>(SERVER_STREAMING);
        peer.send_item(&1u32).await;
        let summary = call.run(|_| async { Ok(Some(1)) }).await;
        assert_eq!(summary.status, Status::internal_error());

        // a non-streaming call must return one.
        let (call, mut peer) = new_call::<u32, u32>(UNARY);
        peer.send_item(&1u32).await;
        let summary = call.run(|_| async { Ok(None) }).await;
        assert_eq!(summary.status, Status::internal_error());
        assert_eq!(
            peer.recv_status().await.status_detail,
            Status::INTERNAL_ERROR_DETAIL
        );

        let (call, mut peer) = new_call::<u32, u32>(UNARY);
        peer.send_item(&1u32).await;
        let summary = call
            .run(|_| async { Err(Error::new(ErrorKind::Io, "disk on fire".into())) })
            .await;
        assert_eq!(summary.status, Status::new(StatusCode::Unknown, "Io: disk on fire"));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_unknown() {
        let (call, mut peer) = new_call::<u32, u32>(UNARY);
        peer.send_item(&1u32).await;
        let summary = call
            .run(|_| async {
                if true {
                    panic!("boom");
                }
                Ok(None)
            })
            .await;
        assert_eq!(summary.status, Status::new(StatusCode::Unknown, "boom"));
        assert_eq!(peer.recv_status().await.status_detail, "boom");
    }

    #[tokio::test]
    async fn test_stream_usage_errors() {
        let (call, mut peer) = new_call::<u32, u32>(UNARY);
        peer.send_item(&1u32).await;
        let summary = call
            .run(|parts| async move {
                let err = parts.requests.next().await.unwrap_err();
                assert_eq!(err.kind, ErrorKind::InvalidArgument);
                let err = parts.responses.write(&1).await.unwrap_err();
                assert_eq!(err.kind, ErrorKind::InvalidArgument);
                Ok(Some(2))
            })
            .await;
        assert_eq!(summary.status, Status::ok());
        assert_eq!(peer.recv_item::<u32>().await, 2);
    }

    #[tokio::test]
    async fn test_late_request_data_is_dropped() {
        let (call, mut peer) = new_call::<u32, u32>(CLIENT_STREAMING);
        peer.send_item(&1u32).await;
        peer.send(Envelope::RequestComplete).await;
        peer.send_item(&2u32).await;

        let summary = call
            .run(|parts| async move {
                let mut total = 0;
                while let Some(item) = parts.requests.next().await? {
                    total += item;
                }
                // give the monitor time to see the late item.
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(parts.requests.next().await?, None);
                Ok(Some(total))
            })
            .await;
        assert_eq!(summary.status, Status::ok());
        assert_eq!(peer.recv_item::<u32>().await, 1);
    }

    #[tokio::test]
    async fn test_stray_request_data_blob_is_skipped() {
        let (call, mut peer) = new_call::<u32, u32>(SERVER_STREAMING);
        peer.send_item(&2u32).await;
        // a blob that would parse as a cancel envelope if read as one.
        peer.send_item(&Envelope::RequestCancel).await;

        let summary = call
            .run(|parts| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert!(!parts.context.is_cancelled());
                parts.responses.write(&parts.request.unwrap_or_default()).await?;
                Ok(None)
            })
            .await;
        assert_eq!(summary.status, Status::ok());
        assert_eq!(peer.recv_item::<u32>().await, 2);
        assert_eq!(peer.recv_status().await.status(), Status::ok());
    }

    #[tokio::test]
    async fn test_second_unary_request_is_skipped() {
        let (call, mut peer) = new_call::<String, String>(UNARY);
        peer.send_item(&"x".to_string()).await;
        peer.send_item(&"y".to_string()).await;

        let summary = call
            .run(|parts| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert!(!parts.context.is_cancelled());
                Ok(parts.request)
            })
            .await;
        assert_eq!(summary.status, Status::ok());
        assert_eq!(peer.recv_item::<String>().await, "x");
        assert_eq!(peer.recv_status().await.status(), Status::ok());
    }

    #[tokio::test]
    async fn test_unary_response_after_cancel_is_withheld() {
        let (call, mut peer) = new_call::<u32, u32>(UNARY);
        peer.send_item(&1u32).await;

        let run = tokio::spawn(call.run(|parts| async move {
            parts.context.cancellation_token().cancelled().await;
            Ok(Some(7))
        }));
        peer.send(Envelope::RequestCancel).await;

        let summary = run.await.unwrap();
        assert_eq!(summary.status, Status::cancelled());
        // the status is the first frame: no response data went out.
        assert_eq!(peer.recv_status().await.status(), Status::cancelled());
    }

    #[tokio::test]
    async fn test_streaming_ok_after_cancel_reports_cancelled() {
        let (call, mut peer) = new_call::<u32, u32>(SERVER_STREAMING);
        peer.send_item(&1u32).await;

        let run = tokio::spawn(call.run(|parts| async move {
            parts.context.cancellation_token().cancelled().await;
            Ok(None)
        }));
        peer.send(Envelope::RequestCancel).await;

        let summary = run.await.unwrap();
        assert_eq!(summary.status, Status::cancelled());
        assert_eq!(peer.recv_status().await.status(), Status::cancelled());
    }

    #[tokio::test]
    async fn test_reject_unknown_method() {
        let (server, client) = tokio::io::duplex(1024);
        let (server_reader, server_writer) = split(server);
        let (mut reader, _writer) = split(client);
        let incoming = IncomingCall::new(
            CallRequest::new("nope"),
            "peer".into(),
            server_reader,
            server_writer,
            Duration::from_secs(1),
            &CancellationToken::new(),
        );
        assert_eq!(incoming.method(), "nope");
        let summary = incoming
            .reject(Status::new(StatusCode::Unimplemented, "method not found: nope"))
            .await;
        assert!(summary.status_sent);

        let token = CancellationToken::new();
        let Envelope::ResponseComplete(complete) = reader.read_expected(&token).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(complete.status().code, StatusCode::Unimplemented);
    }
}
