//! # Client Calls
//!
//! A [`Channel`] starts client calls over a [`Transport`] and drives them through one of the four
//! RPC shapes:
//!
//! | Method kind        | Call object                    | Requests                | Response                |
//! |--------------------|--------------------------------|-------------------------|-------------------------|
//! | `Unary`            | [`AsyncUnaryCall`]             | one, sent right away    | `response()` / `.await` |
//! | `ClientStreaming`  | [`AsyncClientStreamingCall`]   | [`ClientRequestStream`] | `response()`            |
//! | `ServerStreaming`  | [`AsyncServerStreamingCall`]   | one, sent right away    | [`ClientResponseStream`]|
//! | `DuplexStreaming`  | [`AsyncDuplexStreamingCall`]   | [`ClientRequestStream`] | [`ClientResponseStream`]|
//!
//! Every call object also exposes the response headers, the final status and the trailers.
//! Dropping all the handles of a call that has not finished yet cancels it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ferrocall_core::{
//!     client::{CallOptions, Channel},
//!     environment::Environment,
//!     marshal::StringMarshaller,
//!     method::{Method, MethodKind},
//!     transport::loopback::LoopbackTransport,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let env = Environment::new();
//! let channel = Channel::new(&env, LoopbackTransport::new(&env));
//! let method = Method::new(
//!     MethodKind::Unary,
//!     "echo.EchoService",
//!     "UnaryEcho",
//!     StringMarshaller,
//!     StringMarshaller,
//! )?;
//!
//! let reply: String = channel
//!     .unary(&method, &"hello".to_string(), CallOptions::default())?
//!     .await?;
//! # Ok(())
//! # }
//! ```
mod calls;
mod streams;

pub use calls::{
    AsyncClientStreamingCall, AsyncDuplexStreamingCall, AsyncServerStreamingCall, AsyncUnaryCall,
};
pub use streams::{ClientRequestStream, ClientResponseStream};

use crate::{
    batch::WriteFlags,
    call::{CallError, CallGuard, CallState},
    environment::Environment,
    metadata::Metadata,
    method::{Method, MethodKind},
    transport::Transport,
};
use futures_util::FutureExt;
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::Instant;
use tonic::Status;

/// Per-call configuration.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub deadline: Option<Instant>,
    /// Request headers sent when the call starts.
    pub metadata: Metadata,
    /// Flags used by writes that do not specify their own.
    pub write_flags: WriteFlags,
}

impl CallOptions {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_write_flags(mut self, flags: WriteFlags) -> Self {
        self.write_flags = flags;
        self
    }
}

/// Starts client calls over a transport.
#[derive(Clone)]
pub struct Channel {
    env: Environment,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("env", &self.env).finish()
    }
}

impl Channel {
    pub fn new(env: &Environment, transport: Arc<dyn Transport>) -> Self {
        Self {
            env: env.clone(),
            transport,
        }
    }

    /// Performs a unary call (single request, single response).
    ///
    /// The request is sent right away. The response is obtained through
    /// [`AsyncUnaryCall::response`] or by awaiting the call itself.
    ///
    /// # Returns
    ///
    /// * `Ok(AsyncUnaryCall)` - The call has been started.
    /// * `Err(CallError)` - The call could not be created, or the request could not be serialized.
    pub fn unary<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        request: &Req,
        options: CallOptions,
    ) -> Result<AsyncUnaryCall<Resp>, CallError>
    where
        Resp: Send + 'static,
    {
        let call = self.start(method, MethodKind::Unary, &options)?;
        let payload = serialize_request(&call, method, request)?;

        let state = call.state();
        let _ = state.invoke(options.metadata);
        let write = state.send_message(payload, options.write_flags);
        let read = state.receive_message();

        Ok(AsyncUnaryCall::new(
            call,
            write,
            read,
            method.response_marshaller().clone(),
        ))
    }

    /// Performs a client streaming call (stream of requests, single response).
    pub fn client_streaming<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        options: CallOptions,
    ) -> Result<AsyncClientStreamingCall<Req, Resp>, CallError>
    where
        Resp: Send + 'static,
    {
        let call = self.start(method, MethodKind::ClientStreaming, &options)?;

        let state = call.state();
        let _ = state.invoke(options.metadata);
        let read = state.receive_message();

        Ok(AsyncClientStreamingCall::new(
            call.clone(),
            ClientRequestStream::new(
                call,
                method.request_marshaller().clone(),
                options.write_flags,
            ),
            read,
            method.response_marshaller().clone(),
        ))
    }

    /// Performs a server streaming call (single request, stream of responses).
    pub fn server_streaming<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        request: &Req,
        options: CallOptions,
    ) -> Result<AsyncServerStreamingCall<Resp>, CallError>
    where
        Resp: Send + 'static,
    {
        let call = self.start(method, MethodKind::ServerStreaming, &options)?;
        let payload = serialize_request(&call, method, request)?;

        let state = call.state();
        let _ = state.invoke(options.metadata);
        let write = state.send_message(payload, options.write_flags);

        let prelude_state = state.clone();
        let prelude = async move {
            write.await?;
            prelude_state.send_close().await
        }
        .boxed();

        Ok(AsyncServerStreamingCall::new(
            call.clone(),
            ClientResponseStream::new(call, method.response_marshaller().clone(), Some(prelude)),
        ))
    }

    /// Performs a duplex streaming call (stream of requests, stream of responses).
    pub fn duplex_streaming<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        options: CallOptions,
    ) -> Result<AsyncDuplexStreamingCall<Req, Resp>, CallError>
    where
        Resp: Send + 'static,
    {
        let call = self.start(method, MethodKind::DuplexStreaming, &options)?;
        let _ = call.state().invoke(options.metadata);

        Ok(AsyncDuplexStreamingCall::new(
            call.clone(),
            ClientRequestStream::new(
                call.clone(),
                method.request_marshaller().clone(),
                options.write_flags,
            ),
            ClientResponseStream::new(call, method.response_marshaller().clone(), None),
        ))
    }

    fn start<Req, Resp>(
        &self,
        method: &Method<Req, Resp>,
        expected: MethodKind,
        options: &CallOptions,
    ) -> Result<Arc<CallGuard>, CallError> {
        if method.kind() != expected {
            return Err(CallError::InvalidCallState(format!(
                "'{}' is a {:?} method, not {:?}",
                method.path(),
                method.kind(),
                expected
            )));
        }

        let state = CallState::client(
            &self.env,
            self.transport.clone(),
            method.path(),
            options.deadline,
        )?;
        Ok(CallGuard::new(state))
    }
}

fn serialize_request<Req, Resp>(
    call: &CallGuard,
    method: &Method<Req, Resp>,
    request: &Req,
) -> Result<bytes::Bytes, CallError> {
    method
        .request_marshaller()
        .serialize(request)
        .map_err(|err| local_failure(call.state(), err))
}

/// Fails `state` locally after a marshalling error and returns the resulting error.
pub(crate) fn local_failure(state: &Arc<CallState>, err: impl fmt::Display) -> CallError {
    let status = Status::internal(err.to_string());
    tracing::debug!(call = %state.id(), %err, "marshalling failed, cancelling call");
    state.cancel(Some(status.clone()));
    CallError::Status(status)
}
