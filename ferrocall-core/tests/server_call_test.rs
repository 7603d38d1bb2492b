use bytes::Bytes;
use fake_transport::{FakeTransport, end_of_stream, message};
use ferrocall_core::{
    batch::{BatchResult, OpKind, WriteFlags},
    call::{CallError, CallState, Phase},
    environment::Environment,
    metadata::Metadata,
    server::{Server, ServiceRouter},
};
use futures_util::FutureExt;
use std::sync::Arc;
use tonic::{Code, Status};

mod fake_transport;

async fn accepted() -> (Environment, Arc<FakeTransport>, Arc<CallState>) {
    let env = Environment::new();
    let transport = FakeTransport::new(&env);

    let accept = CallState::accept(&env, transport.clone());
    let mut metadata = Metadata::new();
    metadata.insert("x-request-id", "42").unwrap();
    transport.deliver_incoming("/test.Service/Method", metadata);

    let (info, call) = accept.await.expect("call is accepted");
    assert_eq!(info.method, "/test.Service/Method");
    assert_eq!(
        info.metadata.get("x-request-id").and_then(|v| v.as_str()),
        Some("42")
    );
    (env, transport, call)
}

fn closed(cancelled: bool) -> BatchResult {
    BatchResult::default().with_cancelled(cancelled)
}

#[tokio::test]
async fn accepted_call_starts_with_headers_received() {
    let (_env, transport, call) = accepted().await;

    assert_eq!(call.phase(), Phase::HeadersReceived);
    assert!(transport.has_pending(OpKind::RecvCloseOnServer));
    assert!(!call.is_finished());
}

#[tokio::test]
async fn first_message_carries_the_response_headers() {
    let (_env, transport, call) = accepted().await;

    let write = call.send_message(Bytes::from_static(b"hi"), WriteFlags::NONE);
    let batches = transport.pending();
    let kinds = batches.last().map(|s| s.kinds()).unwrap_or_default();
    assert_eq!(kinds, vec![OpKind::SendInitialMetadata, OpKind::SendMessage]);

    transport.complete(OpKind::SendMessage, true, BatchResult::default());
    write.await.unwrap();

    // Headers are only sent once.
    let err = call.send_initial_metadata(Metadata::new()).await.unwrap_err();
    assert!(matches!(err, CallError::InvalidCallState(_)));
}

#[tokio::test]
async fn explicit_response_headers_must_come_first() {
    let (_env, transport, call) = accepted().await;

    let headers = call.send_initial_metadata(Metadata::new());
    transport.complete(OpKind::SendInitialMetadata, true, BatchResult::default());
    headers.await.unwrap();

    let _write = call.send_message(Bytes::from_static(b"hi"), WriteFlags::NONE);
    let kinds = transport.pending().last().map(|s| s.kinds()).unwrap_or_default();
    assert_eq!(kinds, vec![OpKind::SendMessage]);
}

#[tokio::test]
async fn reads_requests_until_the_client_half_closes() {
    let (_env, transport, call) = accepted().await;

    let read = call.receive_message();
    transport.complete(OpKind::RecvMessage, true, message("one"));
    assert_eq!(read.await.unwrap(), Some(Bytes::from_static(b"one")));

    let read = call.receive_message();
    transport.complete(OpKind::RecvMessage, true, end_of_stream());
    assert_eq!(read.await.unwrap(), None);
    assert!(call.receive_message().is_immediate());
}

#[tokio::test]
async fn status_is_recorded_when_sent_and_the_call_finishes_on_close() {
    let (_env, transport, call) = accepted().await;

    let mut trailers = Metadata::new();
    trailers.insert("x-elapsed", "3ms").unwrap();

    let send = call.send_status(Status::ok(""), trailers.clone());
    transport.complete(
        OpKind::SendStatusFromServer,
        true,
        BatchResult::default(),
    );
    send.await.unwrap();

    assert!(!call.is_finished());
    assert!(matches!(
        call.send_message(Bytes::from_static(b"late"), WriteFlags::NONE)
            .await,
        Err(CallError::InvalidCallState(_))
    ));

    transport.complete(OpKind::RecvCloseOnServer, true, closed(false));
    assert_eq!(call.status().await.code(), Code::Ok);
    assert_eq!(call.trailers(), Some(trailers));

    call.dispose();
    assert_eq!(transport.destroyed(), vec![call.id()]);
}

#[tokio::test]
async fn client_cancellation_is_reported_by_the_close_notification() {
    let (_env, transport, call) = accepted().await;

    transport.complete(OpKind::RecvCloseOnServer, true, closed(true));

    assert!(call.is_cancelled());
    assert_eq!(call.status().await.code(), Code::Cancelled);

    let err = call
        .send_message(Bytes::from_static(b"late"), WriteFlags::NONE)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(Code::Cancelled));
}

#[tokio::test]
async fn cancelled_close_keeps_the_status_already_sent() {
    let (_env, transport, call) = accepted().await;

    let send = call.send_status(Status::ok(""), Metadata::new());
    transport.complete(
        OpKind::SendStatusFromServer,
        true,
        BatchResult::default(),
    );
    send.await.unwrap();

    transport.complete(OpKind::RecvCloseOnServer, true, closed(true));

    assert!(call.is_cancelled());
    assert_eq!(call.status().await.code(), Code::Ok);
}

#[tokio::test]
async fn failed_send_aborts_the_call() {
    let (_env, transport, call) = accepted().await;

    let write = call.send_message(Bytes::from_static(b"hi"), WriteFlags::NONE);
    transport.complete(OpKind::SendMessage, false, BatchResult::default());

    assert_eq!(write.await.unwrap_err().code(), Some(Code::Unavailable));
    let cancellations = transport.cancellations();
    assert_eq!(cancellations.len(), 1);
    assert_eq!(cancellations[0].code(), Code::Unavailable);
    assert!(call.is_cancelled());
}

#[tokio::test]
async fn server_release_does_not_wait_for_the_request_stream() {
    let (_env, transport, call) = accepted().await;

    let _send = call.send_status(Status::ok(""), Metadata::new());
    transport.complete(
        OpKind::SendStatusFromServer,
        true,
        BatchResult::default(),
    );
    transport.complete(OpKind::RecvCloseOnServer, true, closed(false));

    call.dispose();
    assert_eq!(transport.destroyed().len(), 1);
    assert_eq!(call.phase(), Phase::Disposed);
}

#[tokio::test]
async fn dropped_accept_releases_the_handed_over_call() {
    let env = Environment::new();
    let transport = FakeTransport::new(&env);

    drop(CallState::accept(&env, transport.clone()));
    let id = transport.deliver_incoming("/test.Service/Method", Metadata::new());

    let cancellations = transport.cancellations();
    assert_eq!(cancellations.len(), 1);
    assert_eq!(cancellations[0].code(), Code::Unavailable);

    transport.complete(OpKind::RecvCloseOnServer, true, closed(true));
    assert_eq!(transport.destroyed(), vec![id]);
}

#[tokio::test]
async fn accept_fails_once_the_environment_shuts_down() {
    let env = Environment::new();
    let transport = FakeTransport::new(&env);

    let accept = CallState::accept(&env, transport.clone());
    env.shutdown();

    assert_eq!(accept.await.unwrap_err().code(), Some(Code::Unavailable));
}

#[tokio::test]
async fn unknown_methods_are_unimplemented() {
    let env = Environment::new();
    let transport = FakeTransport::new(&env);
    let server = Server::new(&env, transport.clone(), ServiceRouter::new());

    let mut accept = std::pin::pin!(server.accept());
    assert!((&mut accept).now_or_never().is_none());
    transport.deliver_incoming("/test.Service/Missing", Metadata::new());
    let call = accept.await.unwrap();
    assert_eq!(call.method(), "/test.Service/Missing");

    let mut served = std::pin::pin!(call.unimplemented());
    assert!((&mut served).now_or_never().is_none());

    let status_batch = transport
        .pending()
        .into_iter()
        .find(|s| s.batch.contains(OpKind::SendStatusFromServer))
        .expect("status was sent");
    let sent = status_batch.batch.ops().iter().find_map(|op| match op {
        ferrocall_core::batch::Op::SendStatusFromServer { status, .. } => Some(status.clone()),
        _ => None,
    });
    assert_eq!(sent.map(|s| s.code()), Some(Code::Unimplemented));

    transport.complete(
        OpKind::SendStatusFromServer,
        true,
        BatchResult::default(),
    );
    transport.complete(OpKind::RecvCloseOnServer, true, closed(false));
    served.await;

    assert_eq!(transport.destroyed().len(), 1);
}
