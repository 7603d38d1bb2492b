use bolero::{TypeGenerator, check};
use bytes::Bytes;
use fake_transport::FakeTransport;
use ferrocall_core::{
    batch::{BatchResult, OpKind, WriteFlags},
    call::CallState,
    environment::Environment,
    metadata::Metadata,
};
use std::{collections::HashSet, sync::Arc};
use tonic::Status;

mod fake_transport;

#[derive(Clone, Copy, Debug, TypeGenerator)]
enum Action {
    Write,
    Read,
    Close,
    CompleteOldest { success: bool, end_of_stream: bool },
    CompleteNewest { success: bool, end_of_stream: bool },
    Status { ok: bool },
    Cancel,
    Dispose,
}

/// Builds the result a well behaved transport reports for a batch of `kinds`.
fn result_for(kinds: &[OpKind], end_of_stream: bool, status: Status) -> BatchResult {
    let mut result = BatchResult::default();
    if kinds.contains(&OpKind::RecvInitialMetadata) {
        result = result.with_initial_metadata(Metadata::new());
    }
    if kinds.contains(&OpKind::RecvMessage) {
        let message = (!end_of_stream).then(|| Bytes::from_static(b"reply"));
        result = result.with_message(message);
    }
    if kinds.contains(&OpKind::RecvStatusOnClient) {
        result = result.with_status(status, Metadata::new());
    }
    result
}

fn complete_at(transport: &FakeTransport, index: usize, success: bool, end_of_stream: bool) {
    let kinds = transport.pending()[index].kinds();
    let result = result_for(&kinds, end_of_stream, Status::ok(""));
    transport.complete_at(index, success, result);
}

fn assert_consistent(env: &Environment, transport: &FakeTransport, call: &Arc<CallState>) {
    let destroyed = transport.destroyed();
    assert!(destroyed.len() <= 1, "call destroyed twice: {destroyed:?}");

    if !destroyed.is_empty() {
        assert!(
            transport.pending().is_empty(),
            "call destroyed with batches still in flight"
        );
        assert_eq!(env.completion_queue().outstanding_for(call.id()), 0);
    }

    let mut seen = HashSet::new();
    for submitted in transport.pending() {
        for kind in submitted.kinds() {
            assert!(seen.insert(kind), "two pending batches contain {kind:?}");
        }
    }
}

#[test]
fn call_is_released_exactly_once() {
    check!().with_type::<Vec<Action>>().for_each(|actions| {
        let env = Environment::new();
        let transport = FakeTransport::new(&env);
        let call = CallState::client(&env, transport.clone(), "/test.Service/Method", None)
            .expect("call is created");

        let _invoke = call.invoke(Metadata::new());

        for action in actions {
            match *action {
                Action::Write => {
                    let _ = call.send_message(Bytes::from_static(b"request"), WriteFlags::NONE);
                }
                Action::Read => {
                    let _ = call.receive_message();
                }
                Action::Close => {
                    let _ = call.send_close();
                }
                Action::CompleteOldest {
                    success,
                    end_of_stream,
                } => {
                    if !transport.pending().is_empty() {
                        complete_at(&transport, 0, success, end_of_stream);
                    }
                }
                Action::CompleteNewest {
                    success,
                    end_of_stream,
                } => {
                    let pending = transport.pending().len();
                    if pending > 0 {
                        complete_at(&transport, pending - 1, success, end_of_stream);
                    }
                }
                Action::Status { ok } => {
                    let index = transport
                        .pending()
                        .iter()
                        .position(|s| s.batch.contains(OpKind::RecvStatusOnClient));
                    if let Some(index) = index {
                        let status = if ok {
                            Status::ok("")
                        } else {
                            Status::unavailable("connection reset")
                        };
                        let kinds = transport.pending()[index].kinds();
                        transport.complete_at(index, true, result_for(&kinds, true, status));
                    }
                }
                Action::Cancel => call.cancel(None),
                Action::Dispose => call.dispose(),
            }

            assert_consistent(&env, &transport, &call);
        }

        // Let the transport finish whatever is left, then release the call.
        while !transport.pending().is_empty() {
            complete_at(&transport, 0, true, true);
            assert_consistent(&env, &transport, &call);
        }
        call.dispose();

        assert_eq!(transport.destroyed(), vec![call.id()]);
        assert!(call.is_finished());
    });
}
