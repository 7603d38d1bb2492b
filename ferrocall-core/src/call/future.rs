use super::CallError;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;
use tonic::Status;

/// The handle returned by every call operation.
///
/// Either already resolved (the operation failed its preconditions, or had nothing to wait for)
/// or waiting for the completion of the batch the operation registered.
#[derive(Debug)]
#[must_use = "call operations report their outcome through the returned future"]
pub struct CallFuture<T> {
    state: State<T>,
}

#[derive(Debug)]
enum State<T> {
    Ready(Option<Result<T, CallError>>),
    Waiting(oneshot::Receiver<Result<T, CallError>>),
}

impl<T> CallFuture<T> {
    pub(crate) fn ready(result: Result<T, CallError>) -> Self {
        Self {
            state: State::Ready(Some(result)),
        }
    }

    pub(crate) fn fail(error: CallError) -> Self {
        Self::ready(Err(error))
    }

    pub(crate) fn waiting(receiver: oneshot::Receiver<Result<T, CallError>>) -> Self {
        Self {
            state: State::Waiting(receiver),
        }
    }

    /// Whether the operation resolved without waiting for a completion.
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }
}

// `T` is never pinned in place.
impl<T> Unpin for CallFuture<T> {}

impl<T> Future for CallFuture<T> {
    type Output = Result<T, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(CallError::InvalidCallState(
                    "call future polled after completion".into(),
                ))
            })),
            State::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::Status(Status::cancelled(
                    "Call was released before the operation completed",
                )))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
