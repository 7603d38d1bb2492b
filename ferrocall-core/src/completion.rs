//! # Completion Queue
//!
//! The completion queue is the meeting point between the engine and a transport.
//!
//! The engine registers every batch it is about to submit, together with the callback that must
//! run when the batch finishes, and receives an opaque [`Tag`]. The transport later reports the
//! outcome of that tag through [`CompletionQueue::complete`], which removes the registration and
//! runs the callback exactly once.
//!
//! The queue is shared by every call of an [`Environment`](crate::environment::Environment) and is
//! safe to use from many threads at once. Callbacks always run without any queue lock held.
use crate::{
    batch::{BatchResult, OpKind},
    transport::CallId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Correlates a registered batch with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("A '{kind:?}' batch is already outstanding for call {call}")]
    AlreadyRegistered { call: CallId, kind: OpKind },
    #[error("No batch is registered under {0}")]
    UnknownTag(Tag),
    #[error("The completion queue has been shut down")]
    ShutDown,
}

type Callback = Box<dyn FnOnce(bool, BatchResult) + Send + 'static>;

struct Registration {
    owner: Option<CallId>,
    kinds: Vec<OpKind>,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_tag: u64,
    pending: HashMap<Tag, Registration>,
    busy: HashSet<(CallId, OpKind)>,
    shut_down: bool,
}

impl Registry {
    fn release(&mut self, registration: &Registration) {
        if let Some(call) = registration.owner {
            for kind in &registration.kinds {
                self.busy.remove(&(call, *kind));
            }
        }
    }
}

/// A thread-safe registry of outstanding batches.
#[derive(Default)]
pub struct CompletionQueue {
    registry: Mutex<Registry>,
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("CompletionQueue")
            .field("outstanding", &registry.pending.len())
            .field("shut_down", &registry.shut_down)
            .finish()
    }
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a batch owned by `owner` and made of `kinds`.
    ///
    /// # Returns
    ///
    /// * `Ok(Tag)` - The tag the transport must complete.
    /// * `Err(AlreadyRegistered)` - A batch sharing one of `kinds` is still outstanding for `owner`.
    /// * `Err(ShutDown)` - The queue no longer accepts registrations.
    pub fn register<F>(
        &self,
        owner: Option<CallId>,
        kinds: &[OpKind],
        callback: F,
    ) -> Result<Tag, CompletionError>
    where
        F: FnOnce(bool, BatchResult) + Send + 'static,
    {
        let mut registry = self.registry.lock();

        if registry.shut_down {
            return Err(CompletionError::ShutDown);
        }

        if let Some(call) = owner {
            let mut seen = HashSet::new();
            for kind in kinds {
                if !seen.insert(*kind) || registry.busy.contains(&(call, *kind)) {
                    return Err(CompletionError::AlreadyRegistered { call, kind: *kind });
                }
            }
            for kind in kinds {
                registry.busy.insert((call, *kind));
            }
        }

        let tag = Tag(registry.next_tag);
        registry.next_tag += 1;
        registry.pending.insert(
            tag,
            Registration {
                owner,
                kinds: kinds.to_vec(),
                callback: Box::new(callback),
            },
        );

        tracing::trace!(%tag, ?owner, ?kinds, "batch registered");
        Ok(tag)
    }

    /// Delivers the outcome of `tag` to its callback.
    pub fn complete(
        &self,
        tag: Tag,
        success: bool,
        result: BatchResult,
    ) -> Result<(), CompletionError> {
        let registration = {
            let mut registry = self.registry.lock();
            let registration = registry
                .pending
                .remove(&tag)
                .ok_or(CompletionError::UnknownTag(tag))?;
            registry.release(&registration);
            registration
        };

        tracing::trace!(%tag, owner = ?registration.owner, success, "batch completed");
        (registration.callback)(success, result);
        Ok(())
    }

    /// Number of registered batches that have not completed yet.
    pub fn outstanding(&self) -> usize {
        self.registry.lock().pending.len()
    }

    /// Number of outstanding batches owned by `call`.
    pub fn outstanding_for(&self, call: CallId) -> usize {
        self.registry
            .lock()
            .pending
            .values()
            .filter(|r| r.owner == Some(call))
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.registry.lock().shut_down
    }

    /// Stops accepting registrations and fails every outstanding batch.
    pub fn shutdown(&self) {
        let drained: Vec<(Tag, Registration)> = {
            let mut registry = self.registry.lock();
            if registry.shut_down {
                return;
            }
            registry.shut_down = true;
            registry.busy.clear();
            registry.pending.drain().collect()
        };

        tracing::debug!(failed = drained.len(), "completion queue shut down");

        for (_, registration) in drained {
            (registration.callback)(false, BatchResult::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(bool, BatchResult) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move |_, _| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn delivers_each_completion_exactly_once() {
        let queue = CompletionQueue::new();
        let (count, callback) = counter();

        let tag = queue
            .register(Some(CallId(1)), &[OpKind::RecvMessage], callback)
            .unwrap();

        queue.complete(tag, true, BatchResult::default()).unwrap();
        assert_eq!(
            queue.complete(tag, true, BatchResult::default()),
            Err(CompletionError::UnknownTag(tag))
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn rejects_conflicting_kinds_on_the_same_call() {
        let queue = CompletionQueue::new();

        queue
            .register(Some(CallId(1)), &[OpKind::RecvMessage], |_, _| {})
            .unwrap();

        let err = queue
            .register(Some(CallId(1)), &[OpKind::RecvMessage], |_, _| {})
            .unwrap_err();
        assert_eq!(
            err,
            CompletionError::AlreadyRegistered {
                call: CallId(1),
                kind: OpKind::RecvMessage
            }
        );

        // Other calls and other kinds are unaffected.
        assert!(
            queue
                .register(Some(CallId(2)), &[OpKind::RecvMessage], |_, _| {})
                .is_ok()
        );
        assert!(
            queue
                .register(Some(CallId(1)), &[OpKind::SendMessage], |_, _| {})
                .is_ok()
        );
        assert_eq!(queue.outstanding_for(CallId(1)), 2);
    }

    #[test]
    fn kind_is_free_again_after_completion() {
        let queue = CompletionQueue::new();

        let tag = queue
            .register(Some(CallId(7)), &[OpKind::SendMessage], |_, _| {})
            .unwrap();
        queue.complete(tag, true, BatchResult::default()).unwrap();

        assert!(
            queue
                .register(Some(CallId(7)), &[OpKind::SendMessage], |_, _| {})
                .is_ok()
        );
    }

    #[test]
    fn shutdown_fails_outstanding_batches() {
        let queue = CompletionQueue::new();
        let failures = Arc::new(AtomicUsize::new(0));

        for call in 0..3 {
            let failures = failures.clone();
            queue
                .register(Some(CallId(call)), &[OpKind::RecvMessage], move |ok, _| {
                    if !ok {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }

        queue.shutdown();

        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert_eq!(queue.outstanding(), 0);
        assert_eq!(
            queue.register(None, &[OpKind::AcceptCall], |_, _| {}),
            Err(CompletionError::ShutDown)
        );
    }
}
