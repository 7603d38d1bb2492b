use super::{ServerContext, ServerRequestStream, ServerResponseStream, abort};
use crate::{
    batch::WriteFlags,
    call::{CallError, CallFuture, CallGuard, CallState, IncomingCallInfo},
    metadata::Metadata,
    method::Method,
};
use std::{fmt, future::Future, sync::Arc};
use tokio::time::Instant;
use tonic::Status;

/// An accepted call, waiting to be served.
///
/// Pick the shape handler matching the method kind. Each of them consumes the call, runs the
/// application handler, reports its outcome to the client and disposes the call once the
/// transport confirms it is over.
pub struct ServerCall {
    call: Arc<CallGuard>,
    info: Arc<IncomingCallInfo>,
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall")
            .field("call", &self.call.state().id())
            .field("method", &self.info.method)
            .finish()
    }
}

impl ServerCall {
    pub(crate) fn new(state: Arc<CallState>, info: IncomingCallInfo) -> Self {
        Self {
            call: CallGuard::new(state),
            info: Arc::new(info),
        }
    }

    /// Wire path of the invoked method.
    pub fn method(&self) -> &str {
        &self.info.method
    }

    pub fn metadata(&self) -> &Metadata {
        &self.info.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.info.deadline
    }

    pub fn state(&self) -> &Arc<CallState> {
        self.call.state()
    }

    /// Serves a unary call: one request in, one response out.
    pub async fn unary<Req, Resp, F, Fut>(self, method: &Method<Req, Resp>, handler: F)
    where
        Req: Send + 'static,
        F: FnOnce(Req, ServerContext) -> Fut,
        Fut: Future<Output = Result<Resp, Status>>,
    {
        let ctx = self.context();
        let mut requests = self.requests(method);

        let outcome = match single_request(&mut requests).await {
            Ok(request) => match handler(request, ctx.clone()).await {
                Ok(response) => {
                    let write = self.write_response(method, &response);
                    write.await.map_err(CallError::into_status)
                }
                Err(status) => Err(status),
            },
            Err(status) => Err(status),
        };

        drop(requests);
        self.finish(&ctx, outcome).await;
    }

    /// Serves a client streaming call: a stream of requests in, one response out.
    pub async fn client_streaming<Req, Resp, F, Fut>(self, method: &Method<Req, Resp>, handler: F)
    where
        Req: Send + 'static,
        F: FnOnce(ServerRequestStream<Req>, ServerContext) -> Fut,
        Fut: Future<Output = Result<Resp, Status>>,
    {
        let ctx = self.context();

        let outcome = match handler(self.requests(method), ctx.clone()).await {
            Ok(response) => {
                let write = self.write_response(method, &response);
                write.await.map_err(CallError::into_status)
            }
            Err(status) => Err(status),
        };

        self.finish(&ctx, outcome).await;
    }

    /// Serves a server streaming call: one request in, a stream of responses out.
    pub async fn server_streaming<Req, Resp, F, Fut>(self, method: &Method<Req, Resp>, handler: F)
    where
        Req: Send + 'static,
        F: FnOnce(Req, ServerResponseStream<Resp>, ServerContext) -> Fut,
        Fut: Future<Output = Result<(), Status>>,
    {
        let ctx = self.context();
        let mut requests = self.requests(method);

        let outcome = match single_request(&mut requests).await {
            Ok(request) => handler(request, self.responses(method), ctx.clone()).await,
            Err(status) => Err(status),
        };

        drop(requests);
        self.finish(&ctx, outcome).await;
    }

    /// Serves a duplex streaming call: requests and responses flow independently.
    pub async fn duplex_streaming<Req, Resp, F, Fut>(self, method: &Method<Req, Resp>, handler: F)
    where
        Req: Send + 'static,
        F: FnOnce(ServerRequestStream<Req>, ServerResponseStream<Resp>, ServerContext) -> Fut,
        Fut: Future<Output = Result<(), Status>>,
    {
        let ctx = self.context();
        let outcome = handler(self.requests(method), self.responses(method), ctx.clone()).await;
        self.finish(&ctx, outcome).await;
    }

    /// Answers the call with `Unimplemented`.
    pub async fn unimplemented(self) {
        let ctx = self.context();
        let status = Status::unimplemented(format!("Method '{}' is not implemented", self.method()));
        self.finish(&ctx, Err(status)).await;
    }

    fn context(&self) -> ServerContext {
        ServerContext::new(self.call.state().clone(), self.info.clone())
    }

    fn requests<Req: Send + 'static, Resp>(
        &self,
        method: &Method<Req, Resp>,
    ) -> ServerRequestStream<Req> {
        ServerRequestStream::new(self.call.clone(), method.request_marshaller().clone())
    }

    fn responses<Req, Resp>(&self, method: &Method<Req, Resp>) -> ServerResponseStream<Resp> {
        ServerResponseStream::new(self.call.clone(), method.response_marshaller().clone())
    }

    fn write_response<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        response: &Resp,
    ) -> CallFuture<()> {
        let state = self.call.state();

        match method.response_marshaller().serialize(response) {
            Ok(payload) => state.send_message(payload, WriteFlags::NONE),
            Err(err) => {
                let status =
                    Status::internal(format!("Failed to serialize response message: {err}"));
                CallFuture::fail(CallError::Status(abort(state, status)))
            }
        }
    }

    /// Sends the final status, then waits for the transport to report the call over.
    async fn finish(self, ctx: &ServerContext, outcome: Result<(), Status>) {
        let state = self.call.state();
        let status = outcome.err().unwrap_or_else(|| Status::ok(""));
        let code = status.code();

        if let Err(err) = state.send_status(status, ctx.take_trailers()).await {
            tracing::debug!(call = %state.id(), %err, "final status not delivered");
        }

        let _ = state.status().await;
        tracing::debug!(call = %state.id(), ?code, "server call done");
    }
}

async fn single_request<Req: Send + 'static>(
    requests: &mut ServerRequestStream<Req>,
) -> Result<Req, Status> {
    match requests.message().await {
        Some(Ok(request)) => Ok(request),
        Some(Err(err)) => Err(err.into_status()),
        None => Err(Status::internal("Expected a request message")),
    }
}
