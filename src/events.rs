// ABOUTME: Typed event surface consumed by dashboards and notifiers.
// ABOUTME: Events are delivered to every registered sink, at least once each.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use crate::types::{DeploymentId, InstanceId, Version};

/// Everything observable about the orchestrator, as one flat event enum.
///
/// Payloads are plain owned data so sinks can forward them across
/// threads or serialize them without touching live state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    DeploymentStarted {
        id: DeploymentId,
        strategy: String,
        from: Option<Version>,
        to: Version,
    },
    DeploymentStepCompleted {
        id: DeploymentId,
        step: String,
        completed: u32,
        total: u32,
    },
    DeploymentCompleted {
        id: DeploymentId,
    },
    DeploymentFailed {
        id: DeploymentId,
        error: String,
    },
    DeploymentRolledBack {
        id: DeploymentId,
    },
    InstanceUpdated {
        id: InstanceId,
        version: Version,
    },
    InstanceHealthy {
        id: InstanceId,
    },
    InstanceUnhealthy {
        id: InstanceId,
    },
    InstanceStopped {
        id: InstanceId,
    },
    EnvironmentHealthy {
        name: String,
    },
    EnvironmentUnhealthy {
        name: String,
    },
    EnvironmentStopped {
        name: String,
    },
    TrafficSwitched {
        from: Option<String>,
        to: String,
    },
    CanaryTrafficRamp {
        id: DeploymentId,
        percent: u8,
    },
    ShutdownInitiated {
        reason: String,
    },
    ShutdownProgress {
        phase: String,
        elapsed_secs: u64,
    },
    ShutdownCompleted,
    ShutdownForced {
        reason: String,
    },
}

/// A consumer of orchestrator events.
///
/// Sinks must not block: `dispatch` is called inline from deployment and
/// shutdown code paths. Anything slow (webhooks, Slack) should hand the
/// event off to its own task.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: &Event);
}

/// Fan-out registry for event sinks.
///
/// Cloning is cheap; clones share the same sink list.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Deliver an event to every registered sink.
    pub fn emit(&self, event: Event) {
        let sinks = self.sinks.read();
        for sink in sinks.iter() {
            sink.dispatch(&event);
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }
}

/// Sink that mirrors every event into the tracing log.
pub struct LogSink;

impl EventSink for LogSink {
    fn dispatch(&self, event: &Event) {
        match event {
            Event::DeploymentFailed { id, error } => {
                tracing::warn!(deployment = %id, %error, "deployment failed");
            }
            Event::InstanceUnhealthy { id } => {
                tracing::warn!(instance = %id, "instance unhealthy");
            }
            Event::EnvironmentUnhealthy { name } => {
                tracing::warn!(environment = %name, "environment unhealthy");
            }
            Event::ShutdownForced { reason } => {
                tracing::error!(%reason, "shutdown forced");
            }
            other => {
                tracing::info!(event = ?other, "event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl EventSink for Recorder {
        fn dispatch(&self, event: &Event) {
            self.0
                .lock()
                .push(serde_json::to_string(event).expect("event serializes"));
        }
    }

    #[test]
    fn emits_to_all_registered_sinks() {
        let bus = EventBus::new();
        let a = Arc::new(Recorder(Mutex::new(vec![])));
        let b = Arc::new(Recorder(Mutex::new(vec![])));
        bus.register(a.clone());
        bus.register(b.clone());

        bus.emit(Event::ShutdownCompleted);

        assert_eq!(a.0.lock().len(), 1);
        assert_eq!(b.0.lock().len(), 1);
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = Event::TrafficSwitched {
            from: Some("blue".to_string()),
            to: "green".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"traffic_switched\""));
        assert!(json.contains("\"to\":\"green\""));
    }

    #[test]
    fn clones_share_sink_registry() {
        let bus = EventBus::new();
        let clone = bus.clone();
        clone.register(Arc::new(LogSink));
        assert_eq!(bus.sink_count(), 1);
    }
}
