//! Subscriber event bus (spec §4.5, §5 "no backpressure"): a single
//! `tokio::sync::broadcast` channel the Orchestrator publishes on and
//! any number of outer-shell subscribers (CLI, HTTP/IPC layer) drain
//! independently.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Stream { feature_id: String, text: String },
    ToolUse { feature_id: String, name: String },
    Complete { feature_id: String, summary: Option<String> },
    Error { feature_id: String, message: String },
    FeatureStarted { feature_id: String },
    FeatureCompleted { feature_id: String },
    FeatureErrored { feature_id: String, message: String },
    FeatureAborted { feature_id: String },
    AutoModeTaskStarted { task_kind: String, project: String },
    AutoModeTaskComplete { task_kind: String, project: String },
    SpecRegenerationProgress { project: String, message: String },
    SuggestionsError { project: String, message: String },
}

/// Default channel capacity (spec §5 leaves subscriber channels
/// unbounded from the producer's perspective; `broadcast` requires a
/// finite ring buffer, so lagging subscribers receive `RecvError::Lagged`
/// instead of the producer blocking — equivalent from the Orchestrator's
/// point of view, since it never waits on a subscriber).
const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publishing never blocks and never fails loudly: with zero
    /// subscribers `send` returns an error that carries no useful
    /// signal for the Orchestrator, so it's ignored.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn independent_subscribers_each_see_every_event() {
        let bus = EventBus::new();
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        bus.publish(EngineEvent::FeatureStarted { feature_id: "f-1".into() });

        let got1 = sub1.recv().await.unwrap();
        let got2 = sub2.recv().await.unwrap();
        assert!(matches!(got1, EngineEvent::FeatureStarted { .. }));
        assert!(matches!(got2, EngineEvent::FeatureStarted { .. }));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::FeatureAborted { feature_id: "f-2".into() });
    }
}
