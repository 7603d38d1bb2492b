use super::{ClientRequestStream, ClientResponseStream};
use crate::{
    call::{CallError, CallFuture, CallGuard, CallState},
    marshal::Marshaller,
    metadata::Metadata,
};
use bytes::Bytes;
use futures_util::{FutureExt, future::BoxFuture};
use std::{future::IntoFuture, sync::Arc};
use tonic::{Code, Status};

type Response<Resp> = BoxFuture<'static, Result<Resp, CallError>>;

/// A unary call in flight.
///
/// Awaiting the call (or [`AsyncUnaryCall::response`]) yields the response message.
pub struct AsyncUnaryCall<Resp> {
    call: Arc<CallGuard>,
    response: Option<Response<Resp>>,
}

impl<Resp: Send + 'static> AsyncUnaryCall<Resp> {
    pub(crate) fn new(
        call: Arc<CallGuard>,
        write: CallFuture<()>,
        read: CallFuture<Option<Bytes>>,
        marshaller: Arc<dyn Marshaller<Resp>>,
    ) -> Self {
        let state = call.state().clone();
        let response = async move {
            write.await?;
            state.send_close().await?;
            let message = read.await;
            single_response(&state, message, marshaller.as_ref()).await
        }
        .boxed();

        Self {
            call,
            response: Some(response),
        }
    }

    /// Waits for the response message.
    ///
    /// A status other than OK always wins over a received message.
    pub async fn response(&mut self) -> Result<Resp, CallError> {
        match self.response.take() {
            Some(response) => response.await,
            None => Err(CallError::InvalidCallState(
                "the response has already been consumed".into(),
            )),
        }
    }

    /// Waits for the response headers.
    pub async fn headers(&self) -> Result<Metadata, CallError> {
        self.call.state().headers().await
    }

    /// Waits for the call to finish and returns its final status.
    pub async fn status(&self) -> Status {
        self.call.state().status().await
    }

    pub fn try_status(&self) -> Option<Status> {
        self.call.state().try_status()
    }

    pub fn trailers(&self) -> Option<Metadata> {
        self.call.state().trailers()
    }

    pub fn cancel(&self) {
        self.call.state().cancel(None);
    }

    pub fn state(&self) -> &Arc<CallState> {
        self.call.state()
    }
}

impl<Resp: Send + 'static> IntoFuture for AsyncUnaryCall<Resp> {
    type Output = Result<Resp, CallError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(mut self) -> Self::IntoFuture {
        async move { self.response().await }.boxed()
    }
}

/// A client streaming call in flight.
///
/// Write the requests through [`AsyncClientStreamingCall::requests`], complete it, then wait for
/// the response.
pub struct AsyncClientStreamingCall<Req, Resp> {
    pub requests: ClientRequestStream<Req>,
    call: Arc<CallGuard>,
    response: Option<Response<Resp>>,
}

impl<Req, Resp: Send + 'static> AsyncClientStreamingCall<Req, Resp> {
    pub(crate) fn new(
        call: Arc<CallGuard>,
        requests: ClientRequestStream<Req>,
        read: CallFuture<Option<Bytes>>,
        marshaller: Arc<dyn Marshaller<Resp>>,
    ) -> Self {
        let state = call.state().clone();
        let response = async move {
            let message = read.await;
            single_response(&state, message, marshaller.as_ref()).await
        }
        .boxed();

        Self {
            requests,
            call,
            response: Some(response),
        }
    }

    /// Waits for the response message.
    pub async fn response(&mut self) -> Result<Resp, CallError> {
        match self.response.take() {
            Some(response) => response.await,
            None => Err(CallError::InvalidCallState(
                "the response has already been consumed".into(),
            )),
        }
    }

    pub async fn headers(&self) -> Result<Metadata, CallError> {
        self.call.state().headers().await
    }

    pub async fn status(&self) -> Status {
        self.call.state().status().await
    }

    pub fn try_status(&self) -> Option<Status> {
        self.call.state().try_status()
    }

    pub fn trailers(&self) -> Option<Metadata> {
        self.call.state().trailers()
    }

    pub fn cancel(&self) {
        self.call.state().cancel(None);
    }

    pub fn state(&self) -> &Arc<CallState> {
        self.call.state()
    }
}

/// A server streaming call in flight.
///
/// The request is written when the call starts and the call is half-closed right before the
/// first response is read.
pub struct AsyncServerStreamingCall<Resp> {
    pub responses: ClientResponseStream<Resp>,
    call: Arc<CallGuard>,
}

impl<Resp: Send + 'static> AsyncServerStreamingCall<Resp> {
    pub(crate) fn new(call: Arc<CallGuard>, responses: ClientResponseStream<Resp>) -> Self {
        Self { responses, call }
    }

    pub async fn headers(&self) -> Result<Metadata, CallError> {
        self.call.state().headers().await
    }

    pub async fn status(&self) -> Status {
        self.call.state().status().await
    }

    pub fn try_status(&self) -> Option<Status> {
        self.call.state().try_status()
    }

    pub fn trailers(&self) -> Option<Metadata> {
        self.call.state().trailers()
    }

    pub fn cancel(&self) {
        self.call.state().cancel(None);
    }

    pub fn state(&self) -> &Arc<CallState> {
        self.call.state()
    }
}

/// A duplex streaming call in flight.
///
/// Requests and responses flow independently: the application decides how writes and reads
/// interleave.
pub struct AsyncDuplexStreamingCall<Req, Resp> {
    pub requests: ClientRequestStream<Req>,
    pub responses: ClientResponseStream<Resp>,
    call: Arc<CallGuard>,
}

impl<Req, Resp: Send + 'static> AsyncDuplexStreamingCall<Req, Resp> {
    pub(crate) fn new(
        call: Arc<CallGuard>,
        requests: ClientRequestStream<Req>,
        responses: ClientResponseStream<Resp>,
    ) -> Self {
        Self {
            requests,
            responses,
            call,
        }
    }

    pub async fn headers(&self) -> Result<Metadata, CallError> {
        self.call.state().headers().await
    }

    pub async fn status(&self) -> Status {
        self.call.state().status().await
    }

    pub fn try_status(&self) -> Option<Status> {
        self.call.state().try_status()
    }

    pub fn trailers(&self) -> Option<Metadata> {
        self.call.state().trailers()
    }

    pub fn cancel(&self) {
        self.call.state().cancel(None);
    }

    pub fn state(&self) -> &Arc<CallState> {
        self.call.state()
    }
}

/// Resolves the single response of a unary or client streaming call once the call finished.
async fn single_response<Resp>(
    state: &CallState,
    message: Result<Option<Bytes>, CallError>,
    marshaller: &dyn Marshaller<Resp>,
) -> Result<Resp, CallError> {
    let status = state.status().await;
    if status.code() != Code::Ok {
        return Err(CallError::Status(status));
    }

    match message? {
        Some(payload) => marshaller.deserialize(&payload).map_err(|err| {
            CallError::Status(Status::internal(format!(
                "Failed to deserialize response message: {err}"
            )))
        }),
        None => Err(CallError::Status(Status::internal(
            "Call finished without a response message",
        ))),
    }
}
