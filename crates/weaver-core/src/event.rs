use crate::types::{HandleStatus, RunId, RunStatus};

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RunStarted {
        run_id: RunId,
        workflow_id: String,
    },
    StepStarted {
        run_id: RunId,
        step_id: String,
        kind: &'static str,
    },
    StepCompleted {
        run_id: RunId,
        step_id: String,
        duration_ms: u64,
    },
    StepFailed {
        run_id: RunId,
        step_id: String,
        error: String,
    },
    StepSkipped {
        run_id: RunId,
        step_id: String,
    },
    /// An async step handed its work to a wait handle.
    StepLaunched {
        run_id: RunId,
        step_id: String,
        handle_id: String,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
    },
    HandleCreated {
        handle_id: String,
        kind: String,
    },
    HandleResolved {
        handle_id: String,
        status: HandleStatus,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
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
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::HandleCreated {
            handle_id: "h1".into(),
            kind: "agent".into(),
        });
        match rx.recv().await.unwrap() {
            EngineEvent::HandleCreated { handle_id, kind } => {
                assert_eq!(handle_id, "h1");
                assert_eq!(kind, "agent");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::StepSkipped {
            run_id: RunId::from_string("r"),
            step_id: "s".into(),
        });
    }
}
