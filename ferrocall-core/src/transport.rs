//! # Transport Boundary
//!
//! The engine never touches the wire. Everything below call state management, such as framing,
//! HTTP/2 or TLS, is hidden behind the [`Transport`] trait.
//!
//! A transport receives batches tagged by the [`CompletionQueue`](crate::completion::CompletionQueue)
//! and must eventually complete every tag it accepted, reporting `success=false` when it could not
//! carry a batch out. Calls are identified by opaque [`CallId`] handles that only the transport
//! can interpret.
//!
//! [`loopback::LoopbackTransport`] is an in-memory implementation that connects client calls to
//! server calls living in the same process.
pub mod loopback;

use crate::{batch::OperationBatch, completion::Tag};
use std::fmt;
use tokio::time::Instant;
use tonic::Status;

/// Opaque handle to a transport-level call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Which end of a call a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unknown call handle {0}")]
    UnknownCall(CallId),
    #[error("The transport has been shut down")]
    ShutDown,
    #[error("The transport rejected the request: {0}")]
    Rejected(String),
}

/// The wire-level collaborator of the call engine.
///
/// Every method may fail. Failures of [`Transport::submit`] and [`Transport::accept_call`] are
/// turned by the engine into a `success=false` completion of the corresponding tag.
pub trait Transport: Send + Sync + 'static {
    /// Creates the transport-level object backing a new client call.
    fn create_call(&self, method: &str, deadline: Option<Instant>)
    -> Result<CallId, TransportError>;

    /// Asks for the next incoming call. `tag` is completed with
    /// [`BatchResult::incoming`](crate::batch::BatchResult::incoming) once a call arrives.
    fn accept_call(&self, tag: Tag) -> Result<(), TransportError>;

    /// Starts `batch` on `call`. `tag` must be completed once every op in the batch is done.
    fn submit(&self, call: CallId, batch: OperationBatch, tag: Tag) -> Result<(), TransportError>;

    /// Requests cancellation of `call`, reporting `status` to the peer.
    fn cancel(&self, call: CallId, status: Status) -> Result<(), TransportError>;

    /// Releases the transport-level object. Called once per call, after its last completion.
    fn destroy(&self, call: CallId);
}
