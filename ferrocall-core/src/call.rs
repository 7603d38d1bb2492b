//! # Call Engine
//!
//! [`CallState`] drives a single call, client or server, from its start to the release of its
//! transport handle. Every public operation checks its preconditions synchronously, registers a
//! batch with the completion queue, hands it to the transport and returns a [`CallFuture`] that
//! resolves once the matching completion is delivered.
//!
//! The client and server drivers (see [`crate::client`] and [`crate::server`]) compose these
//! primitives into the four RPC shapes.
//!
//! ## Lifecycle
//!
//! ```text
//! Created -> Invoked -> HeadersPending -> HeadersReceived -> Streaming -> HalfClosed
//!         -> StatusPending -> Finished -> Disposed
//! ```
//!
//! Phases only ever move forward. Server calls start at `HeadersReceived`, since accepting a call
//! already includes its request headers.
mod future;
mod guard;
mod state;

pub use future::CallFuture;
pub(crate) use guard::CallGuard;
pub use state::{CallSnapshot, CallState, IncomingCallInfo};

/// Lifecycle phase of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Created,
    Invoked,
    HeadersPending,
    HeadersReceived,
    Streaming,
    HalfClosed,
    StatusPending,
    Finished,
    Disposed,
}

/// The single error type every call operation resolves with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The operation is not allowed in the call's current state. Never reaches the transport.
    #[error("Invalid call state: {0}")]
    InvalidCallState(String),
    /// An operation of the same kind is still pending on this call.
    ///
    /// This is the error for a second read or write issued while one is still outstanding.
    #[error("Operation already in progress: {0}")]
    AlreadyInvoked(String),
    /// The call ended, or the operation failed, with this status.
    #[error("Call failed with status {code:?}: {message}", code = .0.code(), message = .0.message())]
    Status(tonic::Status),
}

impl CallError {
    /// Returns the status carried by this error, if any.
    pub fn status(&self) -> Option<&tonic::Status> {
        match self {
            CallError::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Returns the status code of this error, if it carries a status.
    pub fn code(&self) -> Option<tonic::Code> {
        self.status().map(tonic::Status::code)
    }

    /// Converts this error into the status reported to a peer.
    pub fn into_status(self) -> tonic::Status {
        match self {
            CallError::Status(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

impl From<tonic::Status> for CallError {
    fn from(status: tonic::Status) -> Self {
        CallError::Status(status)
    }
}
