use super::local_failure;
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
use tonic::Code;

/// Write side of a client call.
///
/// Only one write may be pending at a time: await each write before starting the next one.
pub struct ClientRequestStream<Req> {
    call: Arc<CallGuard>,
    marshaller: Arc<dyn Marshaller<Req>>,
    flags: WriteFlags,
}

impl<Req> fmt::Debug for ClientRequestStream<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRequestStream")
            .field("call", &self.call.state().id())
            .field("flags", &self.flags)
            .finish()
    }
}

impl<Req> ClientRequestStream<Req> {
    pub(crate) fn new(
        call: Arc<CallGuard>,
        marshaller: Arc<dyn Marshaller<Req>>,
        flags: WriteFlags,
    ) -> Self {
        Self {
            call,
            marshaller,
            flags,
        }
    }

    /// Sends `message` with the call's default write flags.
    pub fn write(&self, message: &Req) -> CallFuture<()> {
        self.write_with_flags(message, self.flags)
    }

    pub fn write_with_flags(&self, message: &Req, flags: WriteFlags) -> CallFuture<()> {
        let state = self.call.state();
        match self.marshaller.serialize(message) {
            Ok(payload) => state.send_message(payload, flags),
            Err(err) => CallFuture::fail(local_failure(state, err)),
        }
    }

    /// Signals that no more requests will be sent.
    pub fn complete(&self) -> CallFuture<()> {
        self.call.state().send_close()
    }

    /// Writes every request of `requests` in order, then completes the stream.
    pub async fn send_all<S>(&self, requests: S) -> Result<(), CallError>
    where
        S: Stream<Item = Req>,
    {
        let mut requests = std::pin::pin!(requests);
        while let Some(request) = requests.next().await {
            let write = self.write(&request);
            write.await?;
        }
        self.complete().await
    }
}

type NextMessage<Resp> = BoxFuture<'static, Option<Result<Resp, CallError>>>;

/// Read side of a client call.
///
/// Yields every response message, then ends once the call finished with an OK status. A call
/// that finished with any other status yields that status as its last item.
pub struct ClientResponseStream<Resp> {
    call: Arc<CallGuard>,
    marshaller: Arc<dyn Marshaller<Resp>>,
    /// Work that must complete before the first read, e.g. sending the single request.
    prelude: Option<BoxFuture<'static, Result<(), CallError>>>,
    next: Option<NextMessage<Resp>>,
    done: bool,
}

impl<Resp> fmt::Debug for ClientResponseStream<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientResponseStream")
            .field("call", &self.call.state().id())
            .field("done", &self.done)
            .finish()
    }
}

impl<Resp: Send + 'static> ClientResponseStream<Resp> {
    pub(crate) fn new(
        call: Arc<CallGuard>,
        marshaller: Arc<dyn Marshaller<Resp>>,
        prelude: Option<BoxFuture<'static, Result<(), CallError>>>,
    ) -> Self {
        Self {
            call,
            marshaller,
            prelude,
            next: None,
            done: false,
        }
    }

    /// Waits for the next response.
    ///
    /// # Returns
    ///
    /// * `Some(Ok(Resp))` - The next response message.
    /// * `Some(Err(CallError))` - The call failed. No more items follow.
    /// * `None` - The call finished successfully and every message has been read.
    pub async fn message(&mut self) -> Option<Result<Resp, CallError>> {
        self.next().await
    }
}

impl<Resp: Send + 'static> Stream for ClientResponseStream<Resp> {
    type Item = Result<Resp, CallError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.done {
            return Poll::Ready(None);
        }

        if this.next.is_none() {
            let next = next_message(
                this.call.state().clone(),
                this.marshaller.clone(),
                this.prelude.take(),
            );
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

async fn next_message<Resp>(
    state: Arc<CallState>,
    marshaller: Arc<dyn Marshaller<Resp>>,
    prelude: Option<BoxFuture<'static, Result<(), CallError>>>,
) -> Option<Result<Resp, CallError>> {
    if let Some(prelude) = prelude
        && let Err(err) = prelude.await
    {
        return Some(Err(err));
    }

    match state.receive_message().await {
        Ok(Some(payload)) => Some(
            marshaller
                .deserialize(&payload)
                .map_err(|err| local_failure(&state, err)),
        ),
        Ok(None) => {
            let status = state.status().await;
            (status.code() != Code::Ok).then(|| Err(CallError::Status(status)))
        }
        Err(err) => Some(Err(err)),
    }
}
