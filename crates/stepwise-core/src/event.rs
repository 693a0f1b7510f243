use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::traits::EventSink;
use crate::types::RunId;

/// Kind of state transition an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Started,
    Output,
    Error,
    Suspended,
    Resumed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Output => "output",
            Self::Error => "error",
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
        }
    }
}

/// One immutable record in a run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub run_id: RunId,
    pub node_id: String,
    pub event_kind: EventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(
        run_id: &RunId,
        node_id: impl Into<String>,
        event_kind: EventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            run_id: run_id.clone(),
            node_id: node_id.into(),
            event_kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: ExecutionEvent) {
        self.publish(event);
    }
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<ExecutionEvent> {
    fn emit(&self, event: ExecutionEvent) {
        // The consumer may have hung up; the run still finishes.
        let _ = self.send(event);
    }
}

/// Forwards every event to two sinks, in order.
pub struct Tee<'a> {
    first: &'a dyn EventSink,
    second: &'a dyn EventSink,
}

impl<'a> Tee<'a> {
    pub fn new(first: &'a dyn EventSink, second: &'a dyn EventSink) -> Self {
        Self { first, second }
    }
}

impl EventSink for Tee<'_> {
    fn emit(&self, event: ExecutionEvent) {
        self.first.emit(event.clone());
        self.second.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let run = RunId::new();
        bus.emit(ExecutionEvent::new(
            &run,
            "n1",
            EventKind::Started,
            serde_json::Value::Null,
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.node_id, "n1");
        assert_eq!(event.event_kind, EventKind::Started);
        assert_eq!(event.run_id, run);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(ExecutionEvent::new(
            &RunId::new(),
            "n1",
            EventKind::Output,
            serde_json::json!("x"),
        ));
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = ExecutionEvent::new(
            &RunId::from_string("r1"),
            "n1",
            EventKind::Suspended,
            serde_json::json!({"prompt": "ok?"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(json["eventKind"], "suspended");
        assert_eq!(json["payload"]["prompt"], "ok?");
    }

    #[tokio::test]
    async fn test_tee_forwards_to_both() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let bus = EventBus::new(4);
        let mut bus_rx = bus.subscribe();
        let tee = Tee::new(&tx, &bus);
        tee.emit(ExecutionEvent::new(
            &RunId::new(),
            "n",
            EventKind::Resumed,
            serde_json::Value::Null,
        ));
        assert_eq!(rx.recv().await.unwrap().event_kind, EventKind::Resumed);
        assert_eq!(bus_rx.recv().await.unwrap().event_kind, EventKind::Resumed);
    }
}
