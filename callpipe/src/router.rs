use std::{collections::HashMap, future::Future, sync::Arc};

use foldhash::fast::RandomState;
use futures_util::{FutureExt, future::BoxFuture};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    CallContext, CallParts, CallShape, CallSummary, Error, ErrorKind, IncomingCall, Method,
    RequestStream, ResponseStream, Result, ServerCall, Status, StatusCode,
};

type MethodHandler = Box<dyn Fn(IncomingCall) -> BoxFuture<'static, CallSummary> + Send + Sync>;

/// Method table: dispatches incoming calls on their method name.
#[derive(Default)]
pub struct Router {
    methods: HashMap<&'static str, (Method, MethodHandler), RandomState>,
}

fn missing_request() -> Error {
    Error::new(
        ErrorKind::InternalBug,
        "non-streaming call invoked without its request".into(),
    )
}

impl Router {
    /// Registers a handler that sees the whole call.
    ///
    /// The handler returns the single response of non-streaming calls, and
    /// `None` for response-streaming calls. A later registration under the
    /// same name replaces the earlier one.
    pub fn add_method<Req, Rsp, F, Fut>(&mut self, method: Method, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(CallParts<Req, Rsp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Rsp>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: MethodHandler = Box::new(move |incoming| {
            let handler = handler.clone();
            ServerCall::<Req, Rsp>::new(method, incoming)
                .run(move |parts| (*handler)(parts))
                .boxed()
        });
        if self.methods.insert(method.name, (method, erased)).is_some() {
            tracing::warn!("method {} registered twice", method.name);
        }
    }

    pub fn add_unary<Req, Rsp, F, Fut>(&mut self, method: Method, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        debug_assert_eq!(method.shape, CallShape::Unary);
        self.add_method(method, move |parts: CallParts<Req, Rsp>| {
            let call = parts.request.map(|request| handler(parts.context, request));
            async move {
                match call {
                    Some(call) => call.await.map(Some),
                    None => Err(missing_request()),
                }
            }
        });
    }

    pub fn add_client_streaming<Req, Rsp, F, Fut>(&mut self, method: Method, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(CallContext, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        debug_assert_eq!(method.shape, CallShape::ClientStreaming);
        self.add_method(method, move |parts: CallParts<Req, Rsp>| {
            handler(parts.context, parts.requests).map(|r| r.map(Some))
        });
    }

    pub fn add_server_streaming<Req, Rsp, F, Fut>(&mut self, method: Method, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(CallContext, Req, ResponseStream<Rsp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        debug_assert_eq!(method.shape, CallShape::ServerStreaming);
        self.add_method(method, move |parts: CallParts<Req, Rsp>| {
            let call = parts
                .request
                .map(|request| handler(parts.context, request, parts.responses));
            async move {
                match call {
                    Some(call) => call.await.map(|()| None),
                    None => Err(missing_request()),
                }
            }
        });
    }

    pub fn add_duplex_streaming<Req, Rsp, F, Fut>(&mut self, method: Method, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(CallContext, RequestStream<Req>, ResponseStream<Rsp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        debug_assert_eq!(method.shape, CallShape::DuplexStreaming);
        self.add_method(method, move |parts: CallParts<Req, Rsp>| {
            handler(parts.context, parts.requests, parts.responses).map(|r| r.map(|()| None))
        });
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name).map(|(method, _)| method)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.keys().copied()
    }

    /// Runs `incoming` against its method, or answers `Unimplemented`.
    pub async fn dispatch(&self, incoming: IncomingCall) -> CallSummary {
        if let Some((_, handler)) = self.methods.get(incoming.method()) {
            handler(incoming).await
        } else {
            let m = format!("method not found: {}", incoming.method());
            tracing::warn!("{m} (peer {})", incoming.context().peer());
            incoming
                .reject(Status::new(StatusCode::Unimplemented, m))
                .await
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        Encoding,
        msg::{CallRequest, Envelope},
        transport::split,
    };

    #[tokio::test]
    async fn test_dispatch_by_name() {
        const ECHO: Method = Method::unary("test/Echo").with_encoding(Encoding::Json);
        let mut router = Router::default();
        router.add_unary(ECHO, |_ctx, req: String| async move { Ok(req) });
        assert_eq!(router.get("test/Echo"), Some(&ECHO));
        assert_eq!(router.method_names().collect::<Vec<_>>(), vec!["test/Echo"]);

        let (server, client) = tokio::io::duplex(1024);
        let (server_reader, server_writer) = split(server);
        let (mut reader, mut writer) = split(client);
        let token = CancellationToken::new();
        writer.write(&Envelope::RequestData, &token).await.unwrap();
        writer.write_blob(br#""hi""#, &token).await.unwrap();

        let incoming = IncomingCall::new(
            CallRequest::new("test/Echo"),
            "peer".into(),
            server_reader,
            server_writer,
            Duration::from_secs(1),
            &token,
        );
        let summary = router.dispatch(incoming).await;
        assert_eq!(summary.status, Status::ok());

        let envelope: Envelope = reader.read_expected(&token).await.unwrap();
        assert_eq!(envelope, Envelope::ResponseData);
        assert_eq!(reader.read_blob(&token).await.unwrap().as_slice(), br#""hi""#);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let router = Router::default();
        let (server, client) = tokio::io::duplex(1024);
        let (server_reader, server_writer) = split(server);
        let (mut reader, _writer) = split(client);
        let token = CancellationToken::new();

        let incoming = IncomingCall::new(
            CallRequest::new("missing/Method"),
            "peer".into(),
            server_reader,
            server_writer,
            Duration::from_secs(1),
            &token,
        );
        let summary = router.dispatch(incoming).await;
        assert_eq!(
            summary.status,
            Status::new(StatusCode::Unimplemented, "method not found: missing/Method")
        );
        let Envelope::ResponseComplete(complete) = reader.read_expected(&token).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(complete.status(), summary.status);
    }
}
