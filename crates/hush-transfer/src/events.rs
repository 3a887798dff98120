//! Typed event delivery to an optional external dispatcher

use hush_core::CoreEvent;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<CoreEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<CoreEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops every event
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: CoreEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("event receiver dropped");
            }
        }
    }
}

/// Sink plus the receiving end for the dispatcher.
pub fn channel() -> (EventSink, UnboundedReceiver<CoreEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink::new(tx), rx)
}
