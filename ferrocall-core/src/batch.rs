//! # Operation Batches
//!
//! A call talks to its [`Transport`](crate::transport::Transport) exclusively by submitting
//! [`OperationBatch`]es: immutable groups of primitive operations that complete together.
//!
//! Each primitive has a payload-free [`OpKind`]. The call engine guarantees that, for a given
//! call, no two outstanding batches share an `OpKind`; the
//! [`CompletionQueue`](crate::completion::CompletionQueue) double checks it on registration.
use crate::{metadata::Metadata, transport::CallId};
use bytes::Bytes;
use tokio::time::Instant;
use tonic::Status;

/// Hints attached to an outgoing message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// The write may be buffered instead of flushed right away.
    pub buffer_hint: bool,
    /// Skip compression for this message.
    pub no_compress: bool,
}

impl WriteFlags {
    pub const NONE: WriteFlags = WriteFlags {
        buffer_hint: false,
        no_compress: false,
    };

    pub fn buffer_hint(mut self) -> Self {
        self.buffer_hint = true;
        self
    }

    pub fn no_compress(mut self) -> Self {
        self.no_compress = true;
        self
    }
}

/// A primitive operation together with its payload.
#[derive(Debug, Clone)]
pub enum Op {
    SendInitialMetadata(Metadata),
    SendMessage { payload: Bytes, flags: WriteFlags },
    SendCloseFromClient,
    SendStatusFromServer { status: Status, trailers: Metadata },
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
    RecvCloseOnServer,
}

/// The kind of a primitive operation, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    SendInitialMetadata,
    SendMessage,
    SendCloseFromClient,
    SendStatusFromServer,
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
    RecvCloseOnServer,
    /// Server side registration waiting for the transport to hand over a new call.
    AcceptCall,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::SendInitialMetadata(_) => OpKind::SendInitialMetadata,
            Op::SendMessage { .. } => OpKind::SendMessage,
            Op::SendCloseFromClient => OpKind::SendCloseFromClient,
            Op::SendStatusFromServer { .. } => OpKind::SendStatusFromServer,
            Op::RecvInitialMetadata => OpKind::RecvInitialMetadata,
            Op::RecvMessage => OpKind::RecvMessage,
            Op::RecvStatusOnClient => OpKind::RecvStatusOnClient,
            Op::RecvCloseOnServer => OpKind::RecvCloseOnServer,
        }
    }
}

/// An immutable set of operations submitted together.
#[derive(Debug, Clone)]
pub struct OperationBatch {
    ops: Vec<Op>,
}

impl OperationBatch {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn kinds(&self) -> Vec<OpKind> {
        self.ops.iter().map(Op::kind).collect()
    }

    pub fn contains(&self, kind: OpKind) -> bool {
        self.ops.iter().any(|op| op.kind() == kind)
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

/// A call handed over by the transport to an accepting server.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call: CallId,
    /// Wire path of the invoked method, e.g. `/echo.EchoService/UnaryEcho`.
    pub method: String,
    pub deadline: Option<Instant>,
    pub metadata: Metadata,
}

/// Everything a completed batch can carry back.
///
/// Only the fields matching the batch's receive operations are filled in.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// `RecvInitialMetadata`.
    pub initial_metadata: Option<Metadata>,
    /// `RecvMessage`. `None` means the peer will not send more messages.
    pub message: Option<Bytes>,
    /// `RecvStatusOnClient`: the terminal status and its trailers.
    pub status: Option<(Status, Metadata)>,
    /// `RecvCloseOnServer`: whether the call was cancelled rather than finished normally.
    pub cancelled: Option<bool>,
    /// `AcceptCall`.
    pub incoming: Option<IncomingCall>,
}

impl BatchResult {
    pub fn with_initial_metadata(mut self, metadata: Metadata) -> Self {
        self.initial_metadata = Some(metadata);
        self
    }

    pub fn with_message(mut self, message: Option<Bytes>) -> Self {
        self.message = message;
        self
    }

    pub fn with_status(mut self, status: Status, trailers: Metadata) -> Self {
        self.status = Some((status, trailers));
        self
    }

    pub fn with_cancelled(mut self, cancelled: bool) -> Self {
        self.cancelled = Some(cancelled);
        self
    }

    pub fn with_incoming(mut self, incoming: IncomingCall) -> Self {
        self.incoming = Some(incoming);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_kinds_follow_the_op_order() {
        let batch = OperationBatch::new(vec![
            Op::SendInitialMetadata(Metadata::new()),
            Op::SendMessage {
                payload: Bytes::from_static(b"hi"),
                flags: WriteFlags::NONE.buffer_hint(),
            },
            Op::RecvInitialMetadata,
        ]);

        assert_eq!(
            batch.kinds(),
            vec![
                OpKind::SendInitialMetadata,
                OpKind::SendMessage,
                OpKind::RecvInitialMetadata
            ]
        );
        assert!(batch.contains(OpKind::SendMessage));
        assert!(!batch.contains(OpKind::RecvMessage));
    }

    #[test]
    fn write_flags_compose() {
        let flags = WriteFlags::default().buffer_hint().no_compress();
        assert!(flags.buffer_hint && flags.no_compress);
        assert_eq!(WriteFlags::default(), WriteFlags::NONE);
    }
}
