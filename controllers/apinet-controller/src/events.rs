//! Kubernetes Event recording.
//!
//! Events are fire-and-forget: a failed publish is logged and never
//! fails the reconcile that emitted it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Reporting component of every event this process emits.
pub const CONTROLLER_NAME: &str = "apinet-controller";

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, resource_ref: &ObjectReference, type_: EventType, reason: &str, action: &str, note: Option<String>);
}

/// Publishes through `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher").finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, resource_ref: &ObjectReference, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons.
pub mod reasons {
    /// No node can host an instance
    pub const OUT_OF_CAPACITY: &str = "OutOfCapacity";
    /// An allocator could not satisfy a request
    pub const ALLOCATION_FAILED: &str = "AllocationFailed";
    /// An instance was bound to a node
    pub const SCHEDULED: &str = "Scheduled";
    /// Writing a binding failed
    pub const FAILED_BINDING: &str = "FailedBinding";
    /// The object's spec cannot be acted on
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// A certificate signing request was approved
    pub const APPROVED: &str = "Approved";
}

/// Event actions.
pub mod actions {
    pub const SCHEDULE: &str = "Schedule";
    pub const ALLOCATE: &str = "Allocate";
    pub const RECONCILE: &str = "Reconcile";
}

/// Publisher remembering every event, for assertions in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: std::sync::Mutex<Vec<RecordedEvent>>,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub name: Option<String>,
    pub warning: bool,
    pub reason: String,
}

#[cfg(test)]
impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Reasons of the events recorded for the object `name`.
    pub fn reasons_for(&self, name: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.name.as_deref() == Some(name))
            .map(|e| e.reason)
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, resource_ref: &ObjectReference, type_: EventType, reason: &str, _action: &str, _note: Option<String>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                name: resource_ref.name.clone(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
            });
        }
    }
}
