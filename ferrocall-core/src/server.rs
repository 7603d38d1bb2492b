//! # Server Calls
//!
//! A [`Server`] accepts the calls a [`Transport`] hands over and drives each of them through a
//! handler registered on a [`ServiceRouter`].
//!
//! Handlers never touch the call engine directly. They receive the request (or a
//! [`ServerRequestStream`]), a [`ServerResponseStream`] for streaming shapes and a
//! [`ServerContext`], and return either the response or the error status to report. The driver
//! sends the messages, the final status and the trailers set on the context, then waits for the
//! transport to confirm the call is over before disposing it.
//!
//! Calls to methods that are not registered are answered with `Unimplemented`.
mod call;
mod context;
mod router;
mod streams;

pub use call::ServerCall;
pub use context::ServerContext;
pub use router::ServiceRouter;
pub use streams::{ServerRequestStream, ServerResponseStream};

use crate::{
    call::{CallError, CallState},
    environment::Environment,
    transport::Transport,
};
use std::{fmt, sync::Arc};

/// Accepts incoming calls and dispatches them to the registered handlers.
pub struct Server {
    env: Environment,
    transport: Arc<dyn Transport>,
    router: Arc<ServiceRouter>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("env", &self.env)
            .field("router", &self.router)
            .finish()
    }
}

impl Server {
    pub fn new(env: &Environment, transport: Arc<dyn Transport>, router: ServiceRouter) -> Self {
        Self {
            env: env.clone(),
            transport,
            router: Arc::new(router),
        }
    }

    /// Waits for the next incoming call.
    pub async fn accept(&self) -> Result<ServerCall, CallError> {
        let (info, state) = CallState::accept(&self.env, self.transport.clone()).await?;
        tracing::debug!(call = %state.id(), method = %info.method, "call accepted");
        Ok(ServerCall::new(state, info))
    }

    /// Accepts calls and spawns their handlers until the environment shuts down.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The environment was shut down.
    /// * `Err(CallError)` - The transport stopped handing over calls.
    pub async fn serve(&self) -> Result<(), CallError> {
        loop {
            let call = match self.accept().await {
                Ok(call) => call,
                Err(_) if self.env.is_shut_down() => {
                    tracing::debug!("environment shut down, server stopping");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(%err, "failed to accept call");
                    return Err(err);
                }
            };

            match self.router.route(call.method()) {
                Some(handler) => {
                    tokio::spawn(handler(call));
                }
                None => {
                    tokio::spawn(call.unimplemented());
                }
            }
        }
    }
}

/// Tears a server call down after a local failure and returns the status it was aborted with.
fn abort(state: &Arc<CallState>, status: tonic::Status) -> tonic::Status {
    tracing::debug!(call = %state.id(), code = ?status.code(), "aborting server call");
    state.cancel(Some(status.clone()));
    status
}
