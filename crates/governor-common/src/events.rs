//! Kubernetes Events emitted by the governor controllers
//!
//! Controllers publish through [`EventPublisher`] so reconcilers stay
//! testable. Publishing is best-effort: a failed event is logged and never
//! fails the reconcile that emitted it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

/// Sink for Events about governed objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `regarding`.
    ///
    /// `reason` and `action` should come from [`reasons`] and [`actions`].
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the events.k8s.io API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`; the pod name, when known, identifies the
    /// replica
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            warn!(
                object = regarding.name.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "failed to publish event"
            );
        }
    }
}

/// Publisher that drops everything
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _regarding: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An Event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event is about
    pub object: String,
    /// Whether this was a Warning
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event action
    pub action: String,
    /// Event note
    pub note: Option<String>,
}

/// Publisher that keeps events in memory, for asserting on them in tests
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Events published so far, oldest first
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons published so far, oldest first
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            object: regarding.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// Managed PolicyBinding created for a membership role
    pub const BINDING_CREATED: &str = "PolicyBindingCreated";
    /// Managed PolicyBinding could not be created
    pub const BINDING_FAILED: &str = "PolicyBindingFailed";
    /// Stale managed PolicyBinding removed
    pub const BINDING_DELETED: &str = "PolicyBindingDeleted";
    /// Organization deleted after its last member's user went away
    pub const ORGANIZATION_DELETED: &str = "OrganizationDeleted";
    /// Quota claim granted
    pub const CLAIM_GRANTED: &str = "ClaimGranted";
    /// Quota claim denied
    pub const CLAIM_DENIED: &str = "ClaimDenied";
    /// Project control plane purge started
    pub const PURGE_STARTED: &str = "PurgeStarted";
    /// Project control plane purge failed, will retry
    pub const PURGE_FAILED: &str = "PurgeFailed";
    /// Project control plane purged and finalizer released
    pub const PURGE_COMPLETE: &str = "PurgeComplete";
    /// Project became ready
    pub const PROJECT_READY: &str = "ProjectReady";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a dependent object
    pub const CREATE: &str = "Create";
    /// Deleting objects
    pub const DELETE: &str = "Delete";
    /// Evaluating a quota claim
    pub const EVALUATE: &str = "Evaluate";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<RecordingEventPublisher>();
    }

    #[tokio::test]
    async fn recording_publisher_keeps_order() {
        let publisher = RecordingEventPublisher::default();
        let regarding = ObjectReference {
            name: Some("web".into()),
            ..Default::default()
        };

        publisher
            .publish(&regarding, EventType::Normal, reasons::PURGE_STARTED, actions::DELETE, None)
            .await;
        publisher
            .publish(
                &regarding,
                EventType::Warning,
                reasons::PURGE_FAILED,
                actions::DELETE,
                Some("rbac forbids DeleteCollection".to_string()),
            )
            .await;

        assert_eq!(publisher.reasons(), vec!["PurgeStarted", "PurgeFailed"]);
        let failed = &publisher.events()[1];
        assert_eq!(failed.object, "web");
        assert!(failed.warning);
        assert_eq!(failed.note.as_deref(), Some("rbac forbids DeleteCollection"));
    }
}
