//! Process-wide publish/subscribe for task, invocation, and status events.
//!
//! Built on a broadcast channel: publishing never blocks, and a subscriber
//! that falls behind loses old events rather than stalling the publisher.
//! SSE consumers in the API layer are the only subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

/// An event on the bus, tagged the way the SSE surface names them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OrcaEvent {
    TaskUpdated { task_id: String, status: String },
    InvocationStarted { invocation_id: i64, task_id: String },
    InvocationCompleted {
        invocation_id: i64,
        task_id: String,
        status: String,
    },
    StatusUpdated { running: i64, ready: i64 },
}

impl OrcaEvent {
    /// The SSE event name for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskUpdated { .. } => "task:updated",
            Self::InvocationStarted { .. } => "invocation:started",
            Self::InvocationCompleted { .. } => "invocation:completed",
            Self::StatusUpdated { .. } => "status:updated",
        }
    }
}

/// Cloneable handle to the event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrcaEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Errors (no subscribers) are swallowed: the bus is
    /// best-effort by contract.
    pub fn publish(&self, event: OrcaEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrcaEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(OrcaEvent::TaskUpdated {
            task_id: "ORC-1".to_string(),
            status: "running".to_string(),
        });

        match rx.recv().await.unwrap() {
            OrcaEvent::TaskUpdated { task_id, status } => {
                assert_eq!(task_id, "ORC-1");
                assert_eq!(status, "running");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_swallowed() {
        let bus = EventBus::new();
        bus.publish(OrcaEvent::StatusUpdated { running: 0, ready: 0 });
    }

    #[test]
    fn event_kinds_match_sse_names() {
        let event = OrcaEvent::InvocationCompleted {
            invocation_id: 1,
            task_id: "ORC-1".to_string(),
            status: "completed".to_string(),
        };
        assert_eq!(event.kind(), "invocation:completed");
    }
}
