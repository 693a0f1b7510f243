use std::sync::Mutex;

use stepwise_core::event::{EventKind, ExecutionEvent};
use stepwise_core::traits::EventSink;

/// Event sink that keeps everything it receives.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// `(kind, node id)` pairs, handy for asserting event order.
    pub fn trace(&self) -> Vec<(EventKind, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.event_kind, e.node_id.clone()))
            .collect()
    }

    pub fn last(&self) -> Option<ExecutionEvent> {
        self.events.lock().unwrap().last().cloned()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: ExecutionEvent) {
        self.events.lock().unwrap().push(event);
    }
}
