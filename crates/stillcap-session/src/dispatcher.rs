//! Result Dispatcher: hands the one terminal outcome to the caller's context.
//!
//! The caller injects an [`OutcomeSink`] at start time; whatever transport
//! sits behind it (a channel polled by a UI loop, an RPC reply, …) is the
//! caller's business.

use std::sync::Arc;

use stillcap_core::{CaptureEvent, CaptureOutcome, ErrorKind, SessionId};
use tokio::sync::mpsc;
use tracing::{info, warn};

// MARK: - OutcomeSink

/// Capability that moves a [`CaptureEvent`] into the caller's execution context.
pub trait OutcomeSink: Send + Sync {
    fn deliver(&self, event: CaptureEvent);
}

/// Forwards events into an unbounded channel; send order is preserved.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CaptureEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver the caller polls.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl OutcomeSink for ChannelSink {
    fn deliver(&self, event: CaptureEvent) {
        if self.tx.send(event).is_err() {
            warn!("Outcome receiver dropped; capture event discarded");
        }
    }
}

/// Wraps a closure as a sink.
pub struct FnSink<F>(pub F);

impl<F> OutcomeSink for FnSink<F>
where
    F: Fn(CaptureEvent) + Send + Sync,
{
    fn deliver(&self, event: CaptureEvent) {
        (self.0)(event)
    }
}

// MARK: - ResultDispatcher

/// Owns the right to emit a session's outcome. Consumed by [`dispatch`](Self::dispatch).
///
/// If it is dropped without dispatching (the session task panicked), it
/// emits `Failed(InternalError)` so the caller still gets exactly one event.
pub struct ResultDispatcher {
    session_id: SessionId,
    sink: Option<Arc<dyn OutcomeSink>>,
}

impl ResultDispatcher {
    pub fn new(session_id: SessionId, sink: Arc<dyn OutcomeSink>) -> Self {
        Self { session_id, sink: Some(sink) }
    }

    pub fn dispatch(mut self, outcome: CaptureOutcome) {
        self.emit(outcome);
    }

    fn emit(&mut self, outcome: CaptureOutcome) {
        let Some(sink) = self.sink.take() else { return };
        info!("Session[{}] outcome: {:?}", self.session_id, outcome);
        sink.deliver(CaptureEvent { session_id: self.session_id, outcome });
    }
}

impl Drop for ResultDispatcher {
    fn drop(&mut self) {
        if self.sink.is_some() {
            warn!("Session[{}] ended without an outcome", self.session_id);
            self.emit(CaptureOutcome::failed(
                ErrorKind::InternalError,
                "session ended without producing an outcome",
            ));
        }
    }
}
