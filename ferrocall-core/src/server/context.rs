use crate::{
    call::{CallFuture, CallState, IncomingCallInfo},
    metadata::Metadata,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::time::Instant;

/// What a handler can learn about, and attach to, the call it serves.
///
/// Cloning is cheap and every clone refers to the same call.
#[derive(Clone)]
pub struct ServerContext {
    state: Arc<CallState>,
    info: Arc<IncomingCallInfo>,
    trailers: Arc<Mutex<Metadata>>,
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("call", &self.state.id())
            .field("method", &self.info.method)
            .finish()
    }
}

impl ServerContext {
    pub(crate) fn new(state: Arc<CallState>, info: Arc<IncomingCallInfo>) -> Self {
        Self {
            state,
            info,
            trailers: Arc::new(Mutex::new(Metadata::new())),
        }
    }

    /// Wire path of the invoked method.
    pub fn method(&self) -> &str {
        &self.info.method
    }

    pub fn request_metadata(&self) -> &Metadata {
        &self.info.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.info.deadline
    }

    /// Sends the response headers. Must happen before the first response message, otherwise
    /// empty headers are sent implicitly.
    pub fn write_response_headers(&self, metadata: Metadata) -> CallFuture<()> {
        self.state.send_initial_metadata(metadata)
    }

    /// Sets the trailers sent together with the final status.
    pub fn set_trailers(&self, trailers: Metadata) {
        *self.trailers.lock() = trailers;
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Resolves once the call is cancelled, by the client or by its deadline. Never resolves for
    /// a call that finishes normally.
    pub async fn cancelled(&self) {
        let _ = self.state.status().await;
        if !self.state.is_cancelled() {
            std::future::pending::<()>().await;
        }
    }

    pub(crate) fn take_trailers(&self) -> Metadata {
        std::mem::take(&mut *self.trailers.lock())
    }
}
