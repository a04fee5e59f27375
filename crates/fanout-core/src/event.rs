//! Progress events published during a batch

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::action::ActionKind;

/// Lifecycle transition of a batch or one of its targets
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A batch is about to be dispatched
    StepStart {
        action: ActionKind,
        object: String,
        targets: Vec<String>,
        at: DateTime<Utc>,
    },
    /// A target's pipeline is starting
    NodeStart {
        target: String,
        action: ActionKind,
        at: DateTime<Utc>,
    },
    /// A target's pipeline has produced its result
    NodeResult {
        target: String,
        action: ActionKind,
        status: String,
        result: Value,
        at: DateTime<Utc>,
    },
    /// A batch has finished
    StepFinish {
        action: ActionKind,
        object: String,
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
}

/// Receiver of executor events
///
/// Called concurrently from every pipeline; implementations must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

impl EventSink for broadcast::Sender<Event> {
    fn publish(&self, event: Event) {
        // no subscribers is fine
        let _ = self.send(event);
    }
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_tagged() {
        let event = Event::NodeStart {
            target: "web1".to_string(),
            action: ActionKind::Command,
            at: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node_start");
        assert_eq!(value["target"], "web1");
        assert_eq!(value["action"], "command");
    }

    #[tokio::test]
    async fn test_broadcast_sink() {
        let (tx, mut rx) = broadcast::channel::<Event>(4);
        tx.publish(Event::StepFinish {
            action: ActionKind::Task,
            object: "m::t".to_string(),
            succeeded: 2,
            failed: 1,
            duration_ms: 10,
            at: Utc::now(),
        });
        match rx.recv().await.unwrap() {
            Event::StepFinish { failed, .. } => assert_eq!(failed, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_broadcast_sink_without_subscribers() {
        let (tx, rx) = broadcast::channel::<Event>(1);
        drop(rx);
        tx.publish(Event::NodeStart {
            target: "a".to_string(),
            action: ActionKind::Upload,
            at: Utc::now(),
        });
    }
}
