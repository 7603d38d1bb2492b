//! # Environment
//!
//! The engine has no process-wide state. What would otherwise be a reference counted global
//! (the completion queue every call registers its batches with) is owned by an [`Environment`],
//! an explicit capability object that transports, channels and servers are built from.
use crate::completion::CompletionQueue;
use std::sync::Arc;

/// Owns the resources shared by every call created from it.
///
/// Cloning is cheap and shares the same resources. The environment lives until
/// [`Environment::shutdown`] is called, which fails every outstanding batch.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    queue: Arc<CompletionQueue>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completion_queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }

    /// Tears the environment down.
    ///
    /// Pending operations of every call resolve with a failure and new calls can no longer be
    /// started. Calling it more than once has no further effect.
    pub fn shutdown(&self) {
        tracing::debug!("shutting down environment");
        self.queue.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.queue.is_shut_down()
    }
}
