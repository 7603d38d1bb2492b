//! # Loopback Transport
//!
//! An in-memory [`Transport`] connecting client calls to server calls of the same process.
//!
//! Every client call created here gets a peer: once its initial metadata is sent, a server side
//! handle is queued for [`Transport::accept_call`]. Both ends then exchange messages through two
//! in-memory queues. The server's status closes the call; a cancellation from either end closes
//! it with the cancellation status and drops undelivered messages.
//!
//! Receive operations that cannot be satisfied yet are parked and re-examined every time the call
//! changes, so a batch only completes once all of its operations are done.
use super::{CallId, Side, Transport, TransportError};
use crate::{
    batch::{BatchResult, IncomingCall, Op, OpKind, OperationBatch},
    completion::{CompletionError, CompletionQueue, Tag},
    environment::Environment,
    metadata::Metadata,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tonic::Status;

/// In-memory transport shared by a client [`Channel`](crate::client::Channel) and a
/// [`Server`](crate::server::Server).
pub struct LoopbackTransport {
    queue: Arc<CompletionQueue>,
    wire: Mutex<Wire>,
}

struct Delivery {
    tag: Tag,
    success: bool,
    result: BatchResult,
}

struct Parked {
    side: Side,
    tag: Tag,
    waiting: Vec<OpKind>,
    success: bool,
    result: BatchResult,
}

struct Pair {
    method: String,
    deadline: Option<Instant>,
    server: Option<CallId>,
    response_headers: Option<Metadata>,
    to_server: VecDeque<Bytes>,
    client_closed: bool,
    to_client: VecDeque<Bytes>,
    status: Option<(Status, Metadata)>,
    cancelled: bool,
    parked: Vec<Parked>,
    live_ends: usize,
}

#[derive(Default)]
struct Wire {
    next_id: u64,
    ends: HashMap<CallId, (u64, Side)>,
    pairs: HashMap<u64, Pair>,
    incoming: VecDeque<IncomingCall>,
    acceptors: VecDeque<Tag>,
}

impl LoopbackTransport {
    pub fn new(env: &Environment) -> Arc<Self> {
        Arc::new(Self {
            queue: env.completion_queue().clone(),
            wire: Mutex::new(Wire::default()),
        })
    }

    /// Number of call handles that have been created and not destroyed yet.
    pub fn live_calls(&self) -> usize {
        self.wire.lock().ends.len()
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        let mut pending = VecDeque::from(deliveries);

        while let Some(delivery) = pending.pop_front() {
            let incoming = delivery.result.incoming.clone();

            match self
                .queue
                .complete(delivery.tag, delivery.success, delivery.result)
            {
                Ok(()) => {}
                Err(CompletionError::UnknownTag(tag)) => {
                    tracing::debug!(%tag, "dropping completion for an abandoned tag");
                    // An acceptor that went away must not swallow the call it was handed.
                    if let Some(incoming) = incoming {
                        let mut wire = self.wire.lock();
                        wire.incoming.push_front(incoming);
                        pending.extend(wire.match_acceptors());
                    }
                }
                Err(err) => tracing::warn!(%err, "failed to deliver completion"),
            }
        }
    }
}

impl Wire {
    fn allocate(&mut self) -> CallId {
        self.next_id += 1;
        CallId(self.next_id)
    }

    fn match_acceptors(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        while !self.incoming.is_empty() && !self.acceptors.is_empty() {
            if let (Some(incoming), Some(tag)) =
                (self.incoming.pop_front(), self.acceptors.pop_front())
            {
                deliveries.push(Delivery {
                    tag,
                    success: true,
                    result: BatchResult::default().with_incoming(incoming),
                });
            }
        }

        deliveries
    }

    fn locate(&self, call: CallId) -> Result<(u64, Side), TransportError> {
        self.ends
            .get(&call)
            .copied()
            .ok_or(TransportError::UnknownCall(call))
    }

    fn pair_mut(&mut self, id: u64, call: CallId) -> Result<&mut Pair, TransportError> {
        self.pairs
            .get_mut(&id)
            .ok_or(TransportError::UnknownCall(call))
    }
}

impl Pair {
    fn new(method: &str, deadline: Option<Instant>) -> Self {
        Self {
            method: method.to_string(),
            deadline,
            server: None,
            response_headers: None,
            to_server: VecDeque::new(),
            client_closed: false,
            to_client: VecDeque::new(),
            status: None,
            cancelled: false,
            parked: Vec::new(),
            live_ends: 1,
        }
    }

    /// Applies a send operation, returning whether it succeeded.
    fn apply_send(&mut self, side: Side, op: Op, new_request: &mut Option<Metadata>) -> bool {
        match (side, op) {
            (Side::Client, Op::SendInitialMetadata(metadata)) => {
                if self.cancelled || self.server.is_some() || new_request.is_some() {
                    return false;
                }
                *new_request = Some(metadata);
                true
            }
            (Side::Client, Op::SendMessage { payload, .. }) => {
                let started = self.server.is_some() || new_request.is_some();
                if !started || self.cancelled || self.client_closed || self.status.is_some() {
                    return false;
                }
                self.to_server.push_back(payload);
                true
            }
            (Side::Client, Op::SendCloseFromClient) => {
                if self.cancelled {
                    return false;
                }
                self.client_closed = true;
                true
            }
            (Side::Server, Op::SendInitialMetadata(metadata)) => {
                if self.cancelled || self.response_headers.is_some() || self.status.is_some() {
                    return false;
                }
                self.response_headers = Some(metadata);
                true
            }
            (Side::Server, Op::SendMessage { payload, .. }) => {
                if self.cancelled || self.status.is_some() {
                    return false;
                }
                self.response_headers.get_or_insert_with(Metadata::new);
                self.to_client.push_back(payload);
                true
            }
            (Side::Server, Op::SendStatusFromServer { status, trailers }) => {
                if self.cancelled || self.status.is_some() {
                    return false;
                }
                self.status = Some((status, trailers));
                true
            }
            (side, op) => {
                tracing::debug!(?side, kind = ?op.kind(), "operation not valid for this side");
                false
            }
        }
    }

    fn accepts_receive(side: Side, kind: OpKind) -> bool {
        matches!(
            (side, kind),
            (
                Side::Client,
                OpKind::RecvInitialMetadata | OpKind::RecvMessage | OpKind::RecvStatusOnClient
            ) | (Side::Server, OpKind::RecvMessage | OpKind::RecvCloseOnServer)
        )
    }

    fn try_satisfy(&mut self, side: Side, kind: OpKind, result: &mut BatchResult) -> bool {
        match (side, kind) {
            (Side::Client, OpKind::RecvInitialMetadata) => {
                if let Some(metadata) = &self.response_headers {
                    result.initial_metadata = Some(metadata.clone());
                    true
                } else if self.status.is_some() {
                    // Trailers-only response.
                    result.initial_metadata = Some(Metadata::new());
                    true
                } else {
                    false
                }
            }
            (Side::Client, OpKind::RecvMessage) => {
                if let Some(message) = self.to_client.pop_front() {
                    result.message = Some(message);
                    true
                } else {
                    self.status.is_some()
                }
            }
            (Side::Client, OpKind::RecvStatusOnClient) => match &self.status {
                Some((status, trailers)) => {
                    result.status = Some((status.clone(), trailers.clone()));
                    true
                }
                None => false,
            },
            (Side::Server, OpKind::RecvMessage) => {
                if let Some(message) = self.to_server.pop_front() {
                    result.message = Some(message);
                    true
                } else {
                    self.client_closed || self.cancelled || self.status.is_some()
                }
            }
            (Side::Server, OpKind::RecvCloseOnServer) => {
                if self.status.is_some() {
                    result.cancelled = Some(self.cancelled);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn pump(&mut self) -> Vec<Delivery> {
        let mut done = Vec::new();

        for mut parked in std::mem::take(&mut self.parked) {
            parked
                .waiting
                .retain(|kind| !self.try_satisfy(parked.side, *kind, &mut parked.result));

            if parked.waiting.is_empty() {
                done.push(Delivery {
                    tag: parked.tag,
                    success: parked.success,
                    result: parked.result,
                });
            } else {
                self.parked.push(parked);
            }
        }

        done
    }

    fn abort(&mut self, status: Status) {
        self.cancelled = true;
        self.status = Some((status, Metadata::new()));
        self.to_client.clear();
        self.to_server.clear();
    }
}

impl Transport for LoopbackTransport {
    fn create_call(
        &self,
        method: &str,
        deadline: Option<Instant>,
    ) -> Result<CallId, TransportError> {
        if self.queue.is_shut_down() {
            return Err(TransportError::ShutDown);
        }

        let mut wire = self.wire.lock();
        let call = wire.allocate();
        wire.ends.insert(call, (call.0, Side::Client));
        wire.pairs.insert(call.0, Pair::new(method, deadline));

        tracing::trace!(%call, method, "loopback call created");
        Ok(call)
    }

    fn accept_call(&self, tag: Tag) -> Result<(), TransportError> {
        if self.queue.is_shut_down() {
            return Err(TransportError::ShutDown);
        }

        let deliveries = {
            let mut wire = self.wire.lock();
            wire.acceptors.push_back(tag);
            wire.match_acceptors()
        };

        self.deliver(deliveries);
        Ok(())
    }

    fn submit(&self, call: CallId, batch: OperationBatch, tag: Tag) -> Result<(), TransportError> {
        let deliveries = {
            let mut guard = self.wire.lock();
            let wire = &mut *guard;
            let (pair_id, side) = wire.locate(call)?;
            let pair = wire.pair_mut(pair_id, call)?;

            let mut parked = Parked {
                side,
                tag,
                waiting: Vec::new(),
                success: true,
                result: BatchResult::default(),
            };
            let mut new_request = None;

            for op in batch.into_ops() {
                let kind = op.kind();
                if Pair::accepts_receive(side, kind) {
                    parked.waiting.push(kind);
                } else if !pair.apply_send(side, op, &mut new_request) {
                    parked.success = false;
                }
            }

            tracing::trace!(%call, %tag, success = parked.success, "loopback batch submitted");
            pair.parked.push(parked);

            if let Some(metadata) = new_request {
                let server = wire.allocate();
                wire.ends.insert(server, (pair_id, Side::Server));

                let pair = wire.pair_mut(pair_id, call)?;
                pair.server = Some(server);
                pair.live_ends += 1;

                let incoming = IncomingCall {
                    call: server,
                    method: pair.method.clone(),
                    deadline: pair.deadline,
                    metadata,
                };
                wire.incoming.push_back(incoming);
            }

            let mut deliveries = wire.pair_mut(pair_id, call)?.pump();
            deliveries.extend(wire.match_acceptors());
            deliveries
        };

        self.deliver(deliveries);
        Ok(())
    }

    fn cancel(&self, call: CallId, status: Status) -> Result<(), TransportError> {
        let deliveries = {
            let mut wire = self.wire.lock();
            let (pair_id, side) = wire.locate(call)?;
            let pair = wire.pair_mut(pair_id, call)?;

            if pair.cancelled || pair.status.is_some() {
                tracing::debug!(%call, "cancellation ignored, call already closed");
                return Ok(());
            }

            tracing::debug!(%call, ?side, code = ?status.code(), "loopback call cancelled");
            pair.abort(status);
            pair.pump()
        };

        self.deliver(deliveries);
        Ok(())
    }

    fn destroy(&self, call: CallId) {
        let deliveries = {
            let mut wire = self.wire.lock();
            let Some((pair_id, side)) = wire.ends.remove(&call) else {
                tracing::warn!(%call, "destroy requested for an unknown call");
                return;
            };
            let Some(pair) = wire.pairs.get_mut(&pair_id) else {
                return;
            };

            pair.live_ends -= 1;
            let mut deliveries = Vec::new();

            if pair.status.is_none() {
                pair.abort(Status::cancelled("Peer released the call"));
                deliveries.extend(pair.pump());
            }

            // Anything the released end left behind can never complete.
            let (orphaned, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut pair.parked)
                .into_iter()
                .partition(|parked| parked.side == side);
            pair.parked = kept;
            deliveries.extend(orphaned.into_iter().map(|parked| Delivery {
                tag: parked.tag,
                success: false,
                result: parked.result,
            }));

            if pair.live_ends == 0 {
                wire.pairs.remove(&pair_id);
            }

            tracing::debug!(%call, ?side, "loopback call destroyed");
            deliveries
        };

        self.deliver(deliveries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    type Log = Arc<Mutex<Vec<(&'static str, bool, BatchResult)>>>;

    struct Wiring {
        env: Environment,
        transport: Arc<LoopbackTransport>,
        log: Log,
    }

    impl Wiring {
        fn new() -> Self {
            let env = Environment::new();
            let transport = LoopbackTransport::new(&env);
            Self {
                env,
                transport,
                log: Log::default(),
            }
        }

        fn submit(&self, call: CallId, label: &'static str, ops: Vec<Op>) {
            let batch = OperationBatch::new(ops);
            let log = self.log.clone();
            let tag = self
                .env
                .completion_queue()
                .register(None, &batch.kinds(), move |success, result| {
                    log.lock().push((label, success, result))
                })
                .unwrap();
            self.transport.submit(call, batch, tag).unwrap();
        }

        fn accept(&self) {
            let log = self.log.clone();
            let tag = self
                .env
                .completion_queue()
                .register(None, &[OpKind::AcceptCall], move |success, result| {
                    log.lock().push(("accept", success, result))
                })
                .unwrap();
            self.transport.accept_call(tag).unwrap();
        }

        fn completed(&self, label: &str) -> Option<(bool, BatchResult)> {
            self.log
                .lock()
                .iter()
                .find(|(l, _, _)| *l == label)
                .map(|(_, success, result)| (*success, result.clone()))
        }

        /// Starts a client call and accepts it, returning both ends.
        fn connect(&self) -> (CallId, CallId) {
            let client = self.transport.create_call("/test.Service/Method", None).unwrap();
            self.accept();
            self.submit(
                client,
                "start",
                vec![Op::SendInitialMetadata(Metadata::new()), Op::RecvInitialMetadata],
            );

            let (_, accepted) = self.completed("accept").expect("call was accepted");
            let server = accepted.incoming.expect("incoming call").call;
            (client, server)
        }
    }

    fn ok_status() -> Op {
        Op::SendStatusFromServer {
            status: Status::ok(""),
            trailers: Metadata::new(),
        }
    }

    #[test]
    fn batches_complete_once_every_op_is_done() {
        let wiring = Wiring::new();
        let (client, server) = wiring.connect();

        // The response headers are not sent yet.
        assert!(wiring.completed("start").is_none());

        let mut headers = Metadata::new();
        headers.insert("x-served-by", "loopback").unwrap();
        wiring.submit(
            server,
            "reply",
            vec![
                Op::SendInitialMetadata(headers.clone()),
                Op::SendMessage {
                    payload: Bytes::from_static(b"pong"),
                    flags: Default::default(),
                },
            ],
        );

        let (success, start) = wiring.completed("start").unwrap();
        assert!(success);
        assert_eq!(start.initial_metadata, Some(headers));
        assert!(wiring.completed("reply").unwrap().0);

        wiring.submit(client, "read", vec![Op::RecvMessage]);
        let (_, read) = wiring.completed("read").unwrap();
        assert_eq!(read.message, Some(Bytes::from_static(b"pong")));
    }

    #[test]
    fn trailers_only_response_completes_every_client_receive() {
        let wiring = Wiring::new();
        let (client, server) = wiring.connect();

        wiring.submit(client, "read", vec![Op::RecvMessage]);
        wiring.submit(client, "status", vec![Op::RecvStatusOnClient]);
        wiring.submit(
            server,
            "status-sent",
            vec![Op::SendStatusFromServer {
                status: Status::not_found("missing"),
                trailers: Metadata::new(),
            }],
        );

        let (_, start) = wiring.completed("start").unwrap();
        assert_eq!(start.initial_metadata, Some(Metadata::new()));

        let (success, read) = wiring.completed("read").unwrap();
        assert!(success);
        assert_eq!(read.message, None);

        let (_, status) = wiring.completed("status").unwrap();
        assert_eq!(status.status.map(|(s, _)| s.code()), Some(Code::NotFound));
    }

    #[test]
    fn close_on_server_waits_for_the_status() {
        let wiring = Wiring::new();
        let (client, server) = wiring.connect();

        wiring.submit(server, "close", vec![Op::RecvCloseOnServer]);
        wiring.submit(client, "half-close", vec![Op::SendCloseFromClient]);
        assert!(wiring.completed("close").is_none());

        wiring.submit(server, "status-sent", vec![ok_status()]);
        let (_, close) = wiring.completed("close").unwrap();
        assert_eq!(close.cancelled, Some(false));
    }

    #[test]
    fn cancellation_closes_both_ends() {
        let wiring = Wiring::new();
        let (client, server) = wiring.connect();

        wiring.submit(server, "close", vec![Op::RecvCloseOnServer]);
        wiring.submit(client, "status", vec![Op::RecvStatusOnClient]);
        wiring
            .transport
            .cancel(client, Status::cancelled("Cancelled"))
            .unwrap();

        let (_, close) = wiring.completed("close").unwrap();
        assert_eq!(close.cancelled, Some(true));
        let (_, status) = wiring.completed("status").unwrap();
        assert_eq!(status.status.map(|(s, _)| s.code()), Some(Code::Cancelled));

        // Sends after the cancellation fail.
        wiring.submit(server, "late", vec![ok_status()]);
        assert!(!wiring.completed("late").unwrap().0);
    }

    #[test]
    fn destroy_closes_the_call_for_the_peer() {
        let wiring = Wiring::new();
        let (client, server) = wiring.connect();
        assert_eq!(wiring.transport.live_calls(), 2);

        wiring.submit(server, "close", vec![Op::RecvCloseOnServer]);
        wiring.submit(client, "read", vec![Op::RecvMessage]);
        wiring.transport.destroy(client);

        // Nothing is left parked and the server learns the peer went away.
        let (_, read) = wiring.completed("read").unwrap();
        assert_eq!(read.message, None);
        assert_eq!(wiring.completed("close").unwrap().1.cancelled, Some(true));

        wiring.transport.destroy(server);
        assert_eq!(wiring.transport.live_calls(), 0);
    }
}
