use super::CallState;
use std::sync::Arc;

/// Owns a call on behalf of the application-facing handles.
///
/// Every handle of one call (the call object and its streams) shares a guard. When the last of
/// them goes away, an unfinished call is cancelled and the call is disposed.
#[derive(Debug)]
pub(crate) struct CallGuard {
    state: Arc<CallState>,
}

impl CallGuard {
    pub(crate) fn new(state: Arc<CallState>) -> Arc<Self> {
        Arc::new(Self { state })
    }

    pub(crate) fn state(&self) -> &Arc<CallState> {
        &self.state
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.state.is_finished() {
            tracing::debug!(call = %self.state.id(), "dropping unfinished call");
            self.state.cancel(None);
        }
        self.state.dispose();
    }
}
