use super::abort;
use crate::{
    batch::WriteFlags,
    call::{CallError, CallFuture, CallGuard, CallState},
    marshal::Marshaller,
};
use futures_util::{FutureExt, Stream, StreamExt, future::BoxFuture};
use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};
use tonic::Status;

type NextRequest<Req> = BoxFuture<'static, Option<Result<Req, CallError>>>;

/// Read side of a server call. Ends once the client half-closed the call.
pub struct ServerRequestStream<Req> {
    call: Arc<CallGuard>,
    marshaller: Arc<dyn Marshaller<Req>>,
    next: Option<NextRequest<Req>>,
    done: bool,
}

impl<Req> fmt::Debug for ServerRequestStream<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRequestStream")
            .field("call", &self.call.state().id())
            .field("done", &self.done)
            .finish()
    }
}

impl<Req: Send + 'static> ServerRequestStream<Req> {
    pub(crate) fn new(call: Arc<CallGuard>, marshaller: Arc<dyn Marshaller<Req>>) -> Self {
        Self {
            call,
            marshaller,
            next: None,
            done: false,
        }
    }

    /// Waits for the next request, `None` once the client will send no more.
    pub async fn message(&mut self) -> Option<Result<Req, CallError>> {
        self.next().await
    }
}

impl<Req: Send + 'static> Stream for ServerRequestStream<Req> {
    type Item = Result<Req, CallError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.done {
            return Poll::Ready(None);
        }

        if this.next.is_none() {
            let next = next_request(this.call.state().clone(), this.marshaller.clone());
            this.next = Some(next.boxed());
        }

        let Some(next) = this.next.as_mut() else {
            return Poll::Ready(None);
        };
        let item = ready!(next.poll_unpin(cx));
        this.next = None;
        if !matches!(item, Some(Ok(_))) {
            this.done = true;
        }

        Poll::Ready(item)
    }
}

async fn next_request<Req>(
    state: Arc<CallState>,
    marshaller: Arc<dyn Marshaller<Req>>,
) -> Option<Result<Req, CallError>> {
    match state.receive_message().await {
        Ok(Some(payload)) => Some(marshaller.deserialize(&payload).map_err(|err| {
            let status = Status::internal(format!("Failed to deserialize request message: {err}"));
            CallError::Status(abort(&state, status))
        })),
        Ok(None) => None,
        Err(err) => Some(Err(err)),
    }
}

/// Write side of a server call.
///
/// Only one write may be pending at a time. The stream is closed by the final status, which the
/// driver sends once the handler returns.
pub struct ServerResponseStream<Resp> {
    call: Arc<CallGuard>,
    marshaller: Arc<dyn Marshaller<Resp>>,
}

impl<Resp> fmt::Debug for ServerResponseStream<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerResponseStream")
            .field("call", &self.call.state().id())
            .finish()
    }
}

impl<Resp> ServerResponseStream<Resp> {
    pub(crate) fn new(call: Arc<CallGuard>, marshaller: Arc<dyn Marshaller<Resp>>) -> Self {
        Self { call, marshaller }
    }

    pub fn write(&self, message: &Resp) -> CallFuture<()> {
        self.write_with_flags(message, WriteFlags::NONE)
    }

    pub fn write_with_flags(&self, message: &Resp, flags: WriteFlags) -> CallFuture<()> {
        let state = self.call.state();
        match self.marshaller.serialize(message) {
            Ok(payload) => state.send_message(payload, flags),
            Err(err) => {
                let status =
                    Status::internal(format!("Failed to serialize response message: {err}"));
                CallFuture::fail(CallError::Status(abort(state, status)))
            }
        }
    }

    /// Writes every response of `responses` in order.
    pub async fn send_all<S>(&self, responses: S) -> Result<(), CallError>
    where
        S: Stream<Item = Resp>,
    {
        let mut responses = std::pin::pin!(responses);
        while let Some(response) = responses.next().await {
            let write = self.write(&response);
            write.await?;
        }
        Ok(())
    }
}
