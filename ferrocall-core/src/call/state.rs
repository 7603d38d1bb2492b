use super::{CallError, CallFuture, Phase};
use crate::{
    batch::{BatchResult, Op, OpKind, OperationBatch, WriteFlags},
    completion::{CompletionError, CompletionQueue, Tag},
    environment::Environment,
    metadata::Metadata,
    transport::{CallId, Side, Transport},
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Weak},
};
use tokio::{
    runtime::Handle,
    sync::{oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tonic::{Code, Status};

/// What the transport told an accepting server about a new call.
#[derive(Debug, Clone)]
pub struct IncomingCallInfo {
    /// Wire path of the invoked method.
    pub method: String,
    /// Request headers sent by the client.
    pub metadata: Metadata,
    pub deadline: Option<Instant>,
}

/// A point-in-time view of a call, mostly useful for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub phase: Phase,
    /// Batches registered with the completion queue and not completed yet.
    pub outstanding: usize,
    /// Operation kinds of the outstanding batches.
    pub pending: Vec<OpKind>,
    pub cancellation_requested: bool,
    pub disposed: bool,
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

#[derive(Debug, Clone, Copy)]
enum Handler {
    Start,
    Status,
    Write,
    Read,
    CloseOnServer,
}

struct PendingWrite {
    reply: Reply<()>,
    /// The write completed with `success=false` and waits for the final status.
    failed: bool,
}

struct PendingRead {
    reply: Reply<Option<Bytes>>,
    failed: bool,
}

struct Submission {
    tag: Tag,
    batch: OperationBatch,
}

struct Inner {
    phase: Phase,
    started: bool,
    pending: BTreeSet<OpKind>,
    outstanding: usize,
    headers_reply: Option<Reply<Metadata>>,
    write: Option<PendingWrite>,
    read: Option<PendingRead>,
    read_done: bool,
    half_close_requested: bool,
    headers_sent: bool,
    headers: Option<Metadata>,
    status: Option<Status>,
    trailers: Option<Metadata>,
    finished: bool,
    cancellation: Option<Status>,
    dispose_requested: bool,
    released: bool,
    deadline_timer: Option<JoinHandle<()>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            phase: Phase::Created,
            started: false,
            pending: BTreeSet::new(),
            outstanding: 0,
            headers_reply: None,
            write: None,
            read: None,
            read_done: false,
            half_close_requested: false,
            headers_sent: false,
            headers: None,
            status: None,
            trailers: None,
            finished: false,
            cancellation: None,
            dispose_requested: false,
            released: false,
            deadline_timer: None,
        }
    }

    fn advance(&mut self, call: CallId, next: Phase) {
        if next > self.phase {
            tracing::trace!(%call, from = ?self.phase, to = ?next, "phase change");
            self.phase = next;
        }
    }

    fn settle_phase(&mut self, call: CallId) {
        if !self.finished && self.half_close_requested && self.read_done {
            self.advance(call, Phase::StatusPending);
        }
    }

    /// Records the terminal status. Only the first status is kept.
    fn record_status(&mut self, status: Status, trailers: Metadata) -> bool {
        if self.status.is_some() {
            return false;
        }
        self.status = Some(status);
        self.trailers = Some(trailers);
        true
    }

    fn cancelled(&self) -> Option<CallError> {
        self.cancellation.clone().map(CallError::Status)
    }

    /// The error reported to operations that failed on the wire, once the final status is known.
    fn final_failure(&self) -> CallError {
        match &self.status {
            Some(status) if status.code() != Code::Ok => CallError::Status(status.clone()),
            _ => CallError::Status(Status::internal("Call failed on the transport")),
        }
    }

    fn check_started(&self) -> Result<(), CallError> {
        if !self.started {
            return Err(CallError::InvalidCallState(
                "call has not been started".into(),
            ));
        }
        Ok(())
    }

    fn check_write_slot(&self) -> Result<(), CallError> {
        if self.write.is_some() {
            return Err(CallError::AlreadyInvoked(
                "only one write can be pending at a time".into(),
            ));
        }
        Ok(())
    }
}

/// Per-call state machine.
///
/// All state lives behind one lock, taken both by the public operations (for their precondition
/// checks and registrations) and by completion callbacks. The lock is never held while calling
/// into the transport.
pub struct CallState {
    id: CallId,
    side: Side,
    deadline: Option<Instant>,
    transport: Arc<dyn Transport>,
    queue: Arc<CompletionQueue>,
    runtime: Option<Handle>,
    inner: Mutex<Inner>,
    headers_tx: watch::Sender<Option<Result<Metadata, CallError>>>,
    status_tx: watch::Sender<Option<Status>>,
}

impl fmt::Debug for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CallState")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("phase", &inner.phase)
            .field("outstanding", &inner.outstanding)
            .finish()
    }
}

impl CallState {
    fn new(
        env: &Environment,
        transport: Arc<dyn Transport>,
        id: CallId,
        side: Side,
        deadline: Option<Instant>,
        runtime: Option<Handle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            side,
            deadline,
            transport,
            queue: env.completion_queue().clone(),
            runtime,
            inner: Mutex::new(Inner::new()),
            headers_tx: watch::Sender::new(None),
            status_tx: watch::Sender::new(None),
        })
    }

    /// Creates the state of a client call to `method`. The call stays in `Created` until
    /// [`CallState::invoke`].
    pub fn client(
        env: &Environment,
        transport: Arc<dyn Transport>,
        method: &str,
        deadline: Option<Instant>,
    ) -> Result<Arc<Self>, CallError> {
        let id = transport.create_call(method, deadline).map_err(|err| {
            CallError::Status(Status::unavailable(format!("Failed to create call: {err}")))
        })?;

        tracing::trace!(call = %id, method, "client call created");
        Ok(Self::new(
            env,
            transport,
            id,
            Side::Client,
            deadline,
            Handle::try_current().ok(),
        ))
    }

    /// Waits for the transport to hand over a new call (server side).
    ///
    /// The returned state starts in `HeadersReceived`, with its close notification armed.
    pub fn accept(
        env: &Environment,
        transport: Arc<dyn Transport>,
    ) -> CallFuture<(IncomingCallInfo, Arc<CallState>)> {
        let (tx, rx) = oneshot::channel();
        let queue = env.completion_queue().clone();
        let runtime = Handle::try_current().ok();
        let env_for_call = env.clone();
        let transport_for_call = transport.clone();

        let registered = queue.register(None, &[OpKind::AcceptCall], move |success, result| {
            let incoming = match (success, result.incoming) {
                (true, Some(incoming)) => incoming,
                _ => {
                    let _ = tx.send(Err(CallError::Status(Status::unavailable(
                        "Server stopped accepting calls",
                    ))));
                    return;
                }
            };

            let state = CallState::new(
                &env_for_call,
                transport_for_call,
                incoming.call,
                Side::Server,
                incoming.deadline,
                runtime,
            );
            state.start_server();

            let info = IncomingCallInfo {
                method: incoming.method,
                metadata: incoming.metadata,
                deadline: incoming.deadline,
            };

            if let Err(Ok((_, state))) = tx.send(Ok((info, state))) {
                tracing::debug!(call = %state.id, "accepted call abandoned by the server");
                state.cancel(Some(Status::unavailable("Server is not accepting calls")));
                state.dispose();
            }
        });

        let tag = match registered {
            Ok(tag) => tag,
            Err(err) => return CallFuture::fail(registration_error(err)),
        };

        if let Err(err) = transport.accept_call(tag) {
            tracing::warn!(%err, "transport failed to accept calls");
            let _ = queue.complete(tag, false, BatchResult::default());
        }

        CallFuture::waiting(rx)
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let inner = self.inner.lock();
        CallSnapshot {
            phase: inner.phase,
            outstanding: inner.outstanding,
            pending: inner.pending.iter().copied().collect(),
            cancellation_requested: inner.cancellation.is_some(),
            disposed: inner.released,
        }
    }

    /// Whether cancellation was requested locally, by a deadline, or by the peer.
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancellation.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// The final status, once the call finished.
    pub fn try_status(&self) -> Option<Status> {
        let inner = self.inner.lock();
        inner.finished.then(|| inner.status.clone()).flatten()
    }

    /// The trailers received with (client) or sent with (server) the final status.
    pub fn trailers(&self) -> Option<Metadata> {
        let inner = self.inner.lock();
        inner.finished.then(|| inner.trailers.clone()).flatten()
    }

    /// Waits for the response headers of a client call.
    pub async fn headers(&self) -> Result<Metadata, CallError> {
        if self.side != Side::Client {
            return Err(CallError::InvalidCallState(
                "response headers are only received by clients".into(),
            ));
        }

        let mut rx = self.headers_tx.subscribe();
        let headers = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CallError::Status(Status::internal("Call state dropped")))?;

        match &*headers {
            Some(result) => result.clone(),
            None => Err(CallError::Status(Status::internal("Headers missing"))),
        }
    }

    /// Waits for the call to finish and returns its final status.
    pub async fn status(&self) -> Status {
        let mut rx = self.status_tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(status) => status
                .clone()
                .unwrap_or_else(|| Status::internal("Status missing")),
            Err(_) => Status::internal("Call state dropped"),
        }
    }

    /// Starts a client call: sends the request headers, asks for the response headers and arms
    /// the reception of the final status.
    ///
    /// The returned future resolves with the response headers.
    pub fn invoke(self: &Arc<Self>, metadata: Metadata) -> CallFuture<Metadata> {
        let (tx, rx) = oneshot::channel();

        let submissions = {
            let mut inner = self.inner.lock();

            if self.side != Side::Client {
                return CallFuture::fail(CallError::InvalidCallState(
                    "only client calls can be invoked".into(),
                ));
            }
            if inner.released {
                return CallFuture::fail(CallError::InvalidCallState(
                    "call has already been disposed".into(),
                ));
            }
            if inner.started {
                return CallFuture::fail(CallError::AlreadyInvoked(
                    "call has already been invoked".into(),
                ));
            }
            if let Some(err) = inner.cancelled() {
                return CallFuture::fail(err);
            }

            inner.started = true;
            inner.advance(self.id, Phase::Invoked);

            let start = match self.register(
                &mut inner,
                vec![Op::SendInitialMetadata(metadata), Op::RecvInitialMetadata],
                Handler::Start,
            ) {
                Ok(submission) => submission,
                Err(err) => {
                    self.fail_locally(&mut inner, err.clone());
                    return CallFuture::fail(err);
                }
            };
            inner.headers_reply = Some(tx);

            let status = match self.register(
                &mut inner,
                vec![Op::RecvStatusOnClient],
                Handler::Status,
            ) {
                Ok(submission) => Some(submission),
                Err(err) => {
                    self.fail_locally(&mut inner, err);
                    None
                }
            };

            inner.advance(self.id, Phase::HeadersPending);
            self.arm_deadline(&mut inner);
            [Some(start), status]
        };

        for submission in submissions.into_iter().flatten() {
            self.submit(submission);
        }

        CallFuture::waiting(rx)
    }

    /// Sends one message.
    ///
    /// Only one write (message, close, headers or status) may be pending at a time. Server calls
    /// send empty response headers first if none were sent yet.
    pub fn send_message(self: &Arc<Self>, payload: Bytes, flags: WriteFlags) -> CallFuture<()> {
        let (tx, rx) = oneshot::channel();

        let submission = {
            let mut inner = self.inner.lock();

            if let Err(err) = self.check_can_write(&inner) {
                return CallFuture::fail(err);
            }

            let mut ops = Vec::with_capacity(2);
            if self.side == Side::Server && !inner.headers_sent {
                inner.headers_sent = true;
                inner.headers = Some(Metadata::new());
                ops.push(Op::SendInitialMetadata(Metadata::new()));
            }
            ops.push(Op::SendMessage { payload, flags });

            match self.start_write(&mut inner, ops, tx) {
                Ok(submission) => submission,
                Err(err) => return CallFuture::fail(err),
            }
        };

        self.submit(submission);
        CallFuture::waiting(rx)
    }

    /// Reads the next message. Resolves to `None` once the peer will send no more messages;
    /// from then on it resolves to `None` right away.
    pub fn receive_message(self: &Arc<Self>) -> CallFuture<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();

        let submission = {
            let mut inner = self.inner.lock();

            if let Err(err) = inner.check_started() {
                return CallFuture::fail(err);
            }
            if inner.read_done {
                return CallFuture::ready(Ok(None));
            }
            if let Some(err) = inner.cancelled() {
                return CallFuture::fail(err);
            }
            if inner.released {
                return CallFuture::fail(CallError::InvalidCallState(
                    "call has already been disposed".into(),
                ));
            }
            if inner.read.is_some() {
                return CallFuture::fail(CallError::AlreadyInvoked(
                    "only one read can be pending at a time".into(),
                ));
            }

            inner.read = Some(PendingRead {
                reply: tx,
                failed: false,
            });

            match self.register(&mut inner, vec![Op::RecvMessage], Handler::Read) {
                Ok(submission) => submission,
                Err(err) => {
                    inner.read = None;
                    return CallFuture::fail(err);
                }
            }
        };

        self.submit(submission);
        CallFuture::waiting(rx)
    }

    /// Tells the server the client will send no more messages.
    ///
    /// Calling it again, or after the call finished, resolves right away.
    pub fn send_close(self: &Arc<Self>) -> CallFuture<()> {
        let (tx, rx) = oneshot::channel();

        let submission = {
            let mut inner = self.inner.lock();

            if self.side != Side::Client {
                return CallFuture::fail(CallError::InvalidCallState(
                    "only clients can half-close a call".into(),
                ));
            }
            if let Err(err) = inner.check_started() {
                return CallFuture::fail(err);
            }
            if inner.finished || inner.half_close_requested {
                return CallFuture::ready(Ok(()));
            }
            if let Some(err) = inner.cancelled() {
                return CallFuture::fail(err);
            }
            if let Err(err) = inner.check_write_slot() {
                return CallFuture::fail(err);
            }

            inner.half_close_requested = true;
            inner.advance(self.id, Phase::HalfClosed);
            inner.settle_phase(self.id);

            match self.start_write(&mut inner, vec![Op::SendCloseFromClient], tx) {
                Ok(submission) => submission,
                Err(err) => return CallFuture::fail(err),
            }
        };

        self.submit(submission);
        CallFuture::waiting(rx)
    }

    /// Sends the response headers of a server call.
    pub fn send_initial_metadata(self: &Arc<Self>, metadata: Metadata) -> CallFuture<()> {
        let (tx, rx) = oneshot::channel();

        let submission = {
            let mut inner = self.inner.lock();

            if self.side != Side::Server {
                return CallFuture::fail(CallError::InvalidCallState(
                    "only servers send response headers".into(),
                ));
            }
            if let Err(err) = self.check_can_write(&inner) {
                return CallFuture::fail(err);
            }
            if inner.headers_sent {
                return CallFuture::fail(CallError::InvalidCallState(
                    "response headers have already been sent".into(),
                ));
            }

            inner.headers_sent = true;
            inner.headers = Some(metadata.clone());

            match self.start_write(&mut inner, vec![Op::SendInitialMetadata(metadata)], tx) {
                Ok(submission) => submission,
                Err(err) => return CallFuture::fail(err),
            }
        };

        self.submit(submission);
        CallFuture::waiting(rx)
    }

    /// Sends the final status of a server call. The status is recorded right away; the call
    /// finishes once the transport confirms the client is done with it.
    pub fn send_status(self: &Arc<Self>, status: Status, trailers: Metadata) -> CallFuture<()> {
        let (tx, rx) = oneshot::channel();

        let submission = {
            let mut inner = self.inner.lock();

            if self.side != Side::Server {
                return CallFuture::fail(CallError::InvalidCallState(
                    "only servers send a status".into(),
                ));
            }
            if let Err(err) = self.check_can_write(&inner) {
                return CallFuture::fail(err);
            }

            let mut ops = Vec::with_capacity(2);
            if !inner.headers_sent {
                inner.headers_sent = true;
                inner.headers = Some(Metadata::new());
                ops.push(Op::SendInitialMetadata(Metadata::new()));
            }
            ops.push(Op::SendStatusFromServer {
                status: status.clone(),
                trailers: trailers.clone(),
            });

            let submission = match self.start_write(&mut inner, ops, tx) {
                Ok(submission) => submission,
                Err(err) => return CallFuture::fail(err),
            };

            inner.record_status(status, trailers);
            inner.half_close_requested = true;
            inner.advance(self.id, Phase::HalfClosed);
            inner.settle_phase(self.id);
            submission
        };

        self.submit(submission);
        CallFuture::waiting(rx)
    }

    /// Requests cancellation of the call. Does not wait.
    ///
    /// Every operation pending at that moment, or issued afterwards, resolves with `status`
    /// (`Cancelled` by default). Has no effect once the call finished.
    pub fn cancel(self: &Arc<Self>, status: Option<Status>) {
        let status = status.unwrap_or_else(|| Status::cancelled("Cancelled"));

        let (notify_transport, release) = {
            let mut inner = self.inner.lock();

            if inner.finished || inner.released || inner.cancellation.is_some() {
                return;
            }

            tracing::debug!(call = %self.id, code = ?status.code(), "cancellation requested");
            inner.cancellation = Some(status.clone());

            if inner.started {
                (true, false)
            } else {
                // Nothing was ever submitted, so no completion will finish the call for us.
                inner.record_status(status.clone(), Metadata::new());
                self.finish(&mut inner);
                (false, self.release_if_possible(&mut inner))
            }
        };

        if notify_transport && let Err(err) = self.transport.cancel(self.id, status) {
            tracing::warn!(call = %self.id, %err, "transport failed to cancel call");
        }
        if release {
            self.release();
        }
    }

    /// Releases the call once it finished and no batch is outstanding.
    ///
    /// Safe to call any number of times, from any thread. Before the call can be released, the
    /// request is remembered and honored by the completion that makes it possible.
    pub fn dispose(&self) {
        let release = {
            let mut inner = self.inner.lock();
            inner.dispose_requested = true;
            self.release_if_possible(&mut inner)
        };

        if release {
            self.release();
        }
    }

    fn check_can_write(&self, inner: &Inner) -> Result<(), CallError> {
        inner.check_started()?;

        if let Some(err) = inner.cancelled() {
            return Err(err);
        }
        if inner.finished {
            return match &inner.status {
                Some(status) if status.code() != Code::Ok => Err(CallError::Status(status.clone())),
                _ => Err(CallError::InvalidCallState(
                    "call has already finished".into(),
                )),
            };
        }
        if inner.half_close_requested {
            let reason = match self.side {
                Side::Client => "no writes are allowed after send_close",
                Side::Server => "no writes are allowed after the status was sent",
            };
            return Err(CallError::InvalidCallState(reason.into()));
        }

        inner.check_write_slot()
    }

    fn start_write(
        self: &Arc<Self>,
        inner: &mut Inner,
        ops: Vec<Op>,
        reply: Reply<()>,
    ) -> Result<Submission, CallError> {
        let submission = self.register(inner, ops, Handler::Write)?;
        inner.write = Some(PendingWrite {
            reply,
            failed: false,
        });
        if inner.phase < Phase::HalfClosed {
            inner.advance(self.id, Phase::Streaming);
        }
        Ok(submission)
    }

    fn register(
        self: &Arc<Self>,
        inner: &mut Inner,
        ops: Vec<Op>,
        handler: Handler,
    ) -> Result<Submission, CallError> {
        let batch = OperationBatch::new(ops);
        let kinds = batch.kinds();
        let state = self.clone();
        let completed_kinds = kinds.clone();

        let tag = self
            .queue
            .register(Some(self.id), &kinds, move |success, result| {
                state.on_complete(handler, &completed_kinds, success, result)
            })
            .map_err(registration_error)?;

        inner.outstanding += 1;
        inner.pending.extend(kinds);
        Ok(Submission { tag, batch })
    }

    fn submit(&self, submission: Submission) {
        let Submission { tag, batch } = submission;

        if let Err(err) = self.transport.submit(self.id, batch, tag) {
            tracing::warn!(call = %self.id, %tag, %err, "transport rejected batch");
            if let Err(err) = self.queue.complete(tag, false, BatchResult::default()) {
                tracing::debug!(call = %self.id, %err, "rejected batch already completed");
            }
        }
    }

    /// Registers the server's close notification and arms its deadline.
    fn start_server(self: &Arc<Self>) {
        let submission = {
            let mut inner = self.inner.lock();
            inner.started = true;
            inner.advance(self.id, Phase::HeadersReceived);
            self.arm_deadline(&mut inner);

            match self.register(
                &mut inner,
                vec![Op::RecvCloseOnServer],
                Handler::CloseOnServer,
            ) {
                Ok(submission) => submission,
                Err(err) => {
                    self.fail_locally(&mut inner, err);
                    return;
                }
            }
        };

        self.submit(submission);
    }

    /// Finishes a call whose status reception could not even be registered.
    fn fail_locally(&self, inner: &mut Inner, err: CallError) {
        let status = match err {
            CallError::Status(status) => status,
            other => Status::internal(other.to_string()),
        };
        inner.record_status(status, Metadata::new());
        self.finish(inner);
    }

    fn arm_deadline(self: &Arc<Self>, inner: &mut Inner) {
        let Some(deadline) = self.deadline else {
            return;
        };
        let Some(runtime) = &self.runtime else {
            tracing::warn!(call = %self.id, "no tokio runtime available, deadline is not enforced");
            return;
        };

        let state: Weak<CallState> = Arc::downgrade(self);
        inner.deadline_timer = Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(state) = state.upgrade() {
                tracing::debug!(call = %state.id, "deadline exceeded");
                state.cancel(Some(Status::deadline_exceeded("Deadline Exceeded")));
            }
        }));
    }

    fn on_complete(
        self: &Arc<Self>,
        handler: Handler,
        kinds: &[OpKind],
        success: bool,
        result: BatchResult,
    ) {
        let (abort, release) = {
            let mut inner = self.inner.lock();
            inner.outstanding = inner.outstanding.saturating_sub(1);
            for kind in kinds {
                inner.pending.remove(kind);
            }

            tracing::trace!(call = %self.id, ?handler, success, "completion delivered");

            let abort = match handler {
                Handler::Start => {
                    self.on_start(&mut inner, success, result);
                    None
                }
                Handler::Status => {
                    self.on_status(&mut inner, success, result);
                    None
                }
                Handler::Write => self.on_write(&mut inner, success),
                Handler::Read => self.on_read(&mut inner, success, result),
                Handler::CloseOnServer => {
                    self.on_close_on_server(&mut inner, success, result);
                    None
                }
            };

            inner.settle_phase(self.id);
            (abort, self.release_if_possible(&mut inner))
        };

        if let Some(status) = abort
            && let Err(err) = self.transport.cancel(self.id, status)
        {
            tracing::warn!(call = %self.id, %err, "transport failed to abort call");
        }
        if release {
            self.release();
        }
    }

    fn on_start(&self, inner: &mut Inner, success: bool, result: BatchResult) {
        let outcome = if let Some(err) = inner.cancelled() {
            Err(err)
        } else if success {
            Ok(result.initial_metadata.unwrap_or_default())
        } else {
            Err(CallError::Status(Status::internal(
                "Failed to receive response headers",
            )))
        };

        if let Ok(headers) = &outcome {
            inner.headers = Some(headers.clone());
            inner.advance(self.id, Phase::HeadersReceived);
        }

        if let Some(reply) = inner.headers_reply.take() {
            let _ = reply.send(outcome.clone());
        }
        self.headers_tx.send_replace(Some(outcome));
    }

    fn on_status(&self, inner: &mut Inner, success: bool, result: BatchResult) {
        let (status, trailers) = match (success, result.status) {
            (true, Some(received)) => received,
            (true, None) => (
                Status::internal("Transport completed the call without a status"),
                Metadata::new(),
            ),
            (false, _) => (
                Status::internal("Failed to receive the call status"),
                Metadata::new(),
            ),
        };

        // Cancellation requested before the status arrived wins over a successful status.
        let status = match &inner.cancellation {
            Some(cancellation) if status.code() == Code::Ok => cancellation.clone(),
            _ => status,
        };

        inner.record_status(status, trailers);
        self.finish(inner);
    }

    fn on_write(&self, inner: &mut Inner, success: bool) -> Option<Status> {
        let pending = inner.write.take()?;

        let outcome = if let Some(err) = inner.cancelled() {
            Err(err)
        } else if success {
            Ok(())
        } else if self.side == Side::Server {
            let status = Status::unavailable("Error sending from server");
            let _ = pending.reply.send(Err(CallError::Status(status.clone())));
            return self.abort(inner, status);
        } else if inner.finished {
            Err(inner.final_failure())
        } else {
            // The reason of the failure is only known once the status arrives.
            inner.write = Some(PendingWrite {
                failed: true,
                ..pending
            });
            return None;
        };

        let _ = pending.reply.send(outcome);
        None
    }

    fn on_read(&self, inner: &mut Inner, success: bool, result: BatchResult) -> Option<Status> {
        let pending = inner.read.take()?;

        let outcome = if let Some(err) = inner.cancelled() {
            Err(err)
        } else if success {
            match result.message {
                Some(message) => {
                    if inner.phase < Phase::HalfClosed {
                        inner.advance(self.id, Phase::Streaming);
                    }
                    Ok(Some(message))
                }
                None => {
                    inner.read_done = true;
                    Ok(None)
                }
            }
        } else if self.side == Side::Server {
            inner.read_done = true;
            let status = Status::unavailable("Error receiving on server");
            let _ = pending.reply.send(Err(CallError::Status(status.clone())));
            return self.abort(inner, status);
        } else {
            inner.read_done = true;
            if inner.finished {
                Err(inner.final_failure())
            } else {
                inner.read = Some(PendingRead {
                    failed: true,
                    ..pending
                });
                return None;
            }
        };

        let _ = pending.reply.send(outcome);
        None
    }

    fn on_close_on_server(&self, inner: &mut Inner, success: bool, result: BatchResult) {
        let cancelled = !success || result.cancelled.unwrap_or(false);

        if cancelled {
            let status = inner
                .cancellation
                .clone()
                .unwrap_or_else(|| Status::cancelled("Call cancelled by the client"));
            tracing::debug!(call = %self.id, "server call cancelled");
            inner.cancellation.get_or_insert_with(|| status.clone());
            inner.record_status(status, Metadata::new());
        } else {
            inner.record_status(Status::ok(""), Metadata::new());
        }

        self.finish(inner);
    }

    /// Tears a server call down after a transport failure.
    fn abort(&self, inner: &mut Inner, status: Status) -> Option<Status> {
        if inner.finished || inner.cancellation.is_some() {
            return None;
        }
        tracing::debug!(call = %self.id, code = ?status.code(), "aborting server call");
        inner.cancellation = Some(status.clone());
        Some(status)
    }

    fn finish(&self, inner: &mut Inner) {
        if inner.finished {
            return;
        }

        inner.finished = true;
        inner.advance(self.id, Phase::Finished);

        if let Some(timer) = inner.deadline_timer.take() {
            timer.abort();
        }

        if inner.write.as_ref().is_some_and(|w| w.failed)
            && let Some(write) = inner.write.take()
        {
            let _ = write.reply.send(Err(inner.final_failure()));
        }
        if inner.read.as_ref().is_some_and(|r| r.failed)
            && let Some(read) = inner.read.take()
        {
            let _ = read.reply.send(Err(inner.final_failure()));
        }

        // Without a start batch in flight nothing else resolves the headers.
        if self.side == Side::Client
            && !inner.pending.contains(&OpKind::RecvInitialMetadata)
            && self.headers_tx.borrow().is_none()
        {
            let err = match &inner.status {
                Some(status) => CallError::Status(status.clone()),
                None => inner.final_failure(),
            };
            if let Some(reply) = inner.headers_reply.take() {
                let _ = reply.send(Err(err.clone()));
            }
            self.headers_tx.send_replace(Some(Err(err)));
        }

        tracing::debug!(
            call = %self.id,
            code = ?inner.status.as_ref().map(Status::code),
            "call finished"
        );
        self.status_tx.send_replace(inner.status.clone());
    }

    fn release_if_possible(&self, inner: &mut Inner) -> bool {
        if inner.released || !inner.finished || inner.outstanding > 0 {
            return false;
        }
        if inner.write.is_some() || inner.read.is_some() {
            return false;
        }

        let reads_settled = self.side == Side::Server
            || inner.read_done
            || inner.dispose_requested
            || inner.cancellation.is_some();
        if !reads_settled {
            return false;
        }

        inner.released = true;
        inner.advance(self.id, Phase::Disposed);
        true
    }

    fn release(&self) {
        tracing::debug!(call = %self.id, "releasing call");
        self.transport.destroy(self.id);
    }
}

fn registration_error(err: CompletionError) -> CallError {
    match err {
        CompletionError::AlreadyRegistered { kind, .. } => {
            CallError::AlreadyInvoked(format!("a '{kind:?}' batch is already outstanding"))
        }
        CompletionError::ShutDown => CallError::Status(Status::unavailable(
            "The environment has been shut down",
        )),
        CompletionError::UnknownTag(tag) => {
            CallError::Status(Status::internal(format!("Unknown completion {tag}")))
        }
    }
}
