#![allow(dead_code)]

use bytes::Bytes;
use ferrocall_core::{
    batch::{BatchResult, IncomingCall, Op, OpKind, OperationBatch},
    completion::{CompletionQueue, Tag},
    environment::Environment,
    metadata::Metadata,
    transport::{CallId, Transport, TransportError},
};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::time::Instant;
use tonic::Status;

/// A batch handed to the transport and not completed yet.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub call: CallId,
    pub tag: Tag,
    pub batch: OperationBatch,
}

impl Submitted {
    pub fn kinds(&self) -> Vec<OpKind> {
        self.batch.kinds()
    }
}

#[derive(Default)]
struct Script {
    next_call: u64,
    pending: Vec<Submitted>,
    submit_count: usize,
    sent_messages: Vec<Bytes>,
    cancelled: Vec<(CallId, Status)>,
    destroyed: Vec<CallId>,
    acceptors: VecDeque<Tag>,
    reject_submissions: bool,
}

/// A transport that never completes anything on its own.
///
/// Tests decide when and how each submitted batch completes, which lets them reproduce any
/// interleaving of completions.
pub struct FakeTransport {
    queue: Arc<CompletionQueue>,
    script: Mutex<Script>,
}

impl FakeTransport {
    pub fn new(env: &Environment) -> Arc<Self> {
        Arc::new(Self {
            queue: env.completion_queue().clone(),
            script: Mutex::new(Script::default()),
        })
    }

    /// Number of batches ever submitted.
    pub fn submit_count(&self) -> usize {
        self.script.lock().submit_count
    }

    pub fn pending(&self) -> Vec<Submitted> {
        self.script.lock().pending.clone()
    }

    pub fn has_pending(&self, kind: OpKind) -> bool {
        self.script
            .lock()
            .pending
            .iter()
            .any(|s| s.batch.contains(kind))
    }

    pub fn sent_messages(&self) -> Vec<Bytes> {
        self.script.lock().sent_messages.clone()
    }

    pub fn cancellations(&self) -> Vec<Status> {
        self.script
            .lock()
            .cancelled
            .iter()
            .map(|(_, status)| status.clone())
            .collect()
    }

    pub fn destroyed(&self) -> Vec<CallId> {
        self.script.lock().destroyed.clone()
    }

    /// Makes every following submission fail.
    pub fn reject_submissions(&self, reject: bool) {
        self.script.lock().reject_submissions = reject;
    }

    /// Completes the oldest pending batch containing `kind`.
    ///
    /// # Panics
    ///
    /// When no such batch is pending.
    pub fn complete(&self, kind: OpKind, success: bool, result: BatchResult) {
        let submitted = {
            let mut script = self.script.lock();
            let index = script
                .pending
                .iter()
                .position(|s| s.batch.contains(kind))
                .unwrap_or_else(|| panic!("no pending batch contains {kind:?}"));
            script.pending.remove(index)
        };

        self.queue
            .complete(submitted.tag, success, result)
            .expect("tag is registered");
    }

    /// Completes the pending batch at `index` (in submission order).
    pub fn complete_at(&self, index: usize, success: bool, result: BatchResult) -> Submitted {
        let submitted = self.script.lock().pending.remove(index);
        self.queue
            .complete(submitted.tag, success, result)
            .expect("tag is registered");
        submitted
    }

    /// Hands a new call to the oldest waiting acceptor.
    pub fn deliver_incoming(&self, method: &str, metadata: Metadata) -> CallId {
        let (tag, call) = {
            let mut script = self.script.lock();
            let tag = script.acceptors.pop_front().expect("no acceptor is waiting");
            script.next_call += 1;
            (tag, CallId(script.next_call))
        };

        let incoming = IncomingCall {
            call,
            method: method.to_string(),
            deadline: None,
            metadata,
        };
        self.queue
            .complete(tag, true, BatchResult::default().with_incoming(incoming))
            .expect("accept tag is registered");
        call
    }
}

impl Transport for FakeTransport {
    fn create_call(
        &self,
        _method: &str,
        _deadline: Option<Instant>,
    ) -> Result<CallId, TransportError> {
        let mut script = self.script.lock();
        script.next_call += 1;
        Ok(CallId(script.next_call))
    }

    fn accept_call(&self, tag: Tag) -> Result<(), TransportError> {
        self.script.lock().acceptors.push_back(tag);
        Ok(())
    }

    fn submit(&self, call: CallId, batch: OperationBatch, tag: Tag) -> Result<(), TransportError> {
        let mut script = self.script.lock();
        script.submit_count += 1;

        if script.reject_submissions {
            return Err(TransportError::Rejected("scripted rejection".into()));
        }

        for op in batch.ops() {
            if let Op::SendMessage { payload, .. } = op {
                script.sent_messages.push(payload.clone());
            }
        }
        script.pending.push(Submitted { call, tag, batch });
        Ok(())
    }

    fn cancel(&self, call: CallId, status: Status) -> Result<(), TransportError> {
        self.script.lock().cancelled.push((call, status));
        Ok(())
    }

    fn destroy(&self, call: CallId) {
        self.script.lock().destroyed.push(call);
    }
}

pub fn ok_status() -> BatchResult {
    BatchResult::default().with_status(Status::ok(""), Metadata::new())
}

pub fn status(status: Status) -> BatchResult {
    BatchResult::default().with_status(status, Metadata::new())
}

pub fn message(payload: &'static str) -> BatchResult {
    BatchResult::default().with_message(Some(Bytes::from_static(payload.as_bytes())))
}

pub fn end_of_stream() -> BatchResult {
    BatchResult::default().with_message(None)
}
