use crate::types::ExecutionEvent;

/// Execution lifecycle fan-out.
///
/// The Scenario and Agent engines publish start/finish events for every
/// scenario run, agent run and step, plus branch selections, parallel joins
/// and recovery versions. The JSONL `ExecutionLogger` is one subscriber;
/// callers can `subscribe` for their own. Publishing never blocks a run and
/// is dropped when nobody listens. A slow subscriber sees `Lagged` instead of
/// stalling the engine.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// A zero capacity is raised to 1; broadcast channels need at least one slot.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(ExecutionEvent::RecoveryVersionCreated {
            definition_id: "agent-1".into(),
            version_id: "v-1".into(),
        });
        match rx.recv().await.unwrap() {
            ExecutionEvent::RecoveryVersionCreated { definition_id, .. } => {
                assert_eq!(definition_id, "agent-1")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_capacity_still_delivers() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(ExecutionEvent::RecoveryVersionCreated {
            definition_id: "agent-0".into(),
            version_id: "v-0".into(),
        });
        match rx.recv().await.unwrap() {
            ExecutionEvent::RecoveryVersionCreated { version_id, .. } => {
                assert_eq!(version_id, "v-0")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(ExecutionEvent::RecoveryVersionCreated {
            definition_id: "a".into(),
            version_id: "v".into(),
        });
    }
}
