//! Orchestration notifications
//!
//! Events are fire-and-forget: callers go through [`publish`], which logs a
//! failed delivery and never returns an error to orchestration code.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::Resource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

use crate::controller::Result;
use crate::crd::PgCluster;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CloneStepCompleted,
    CloneFailed,
    FailoverCompleted,
    StandbyEnabled,
    StandbyDisabled,
    ClusterShutdown,
    ClusterStartup,
    RollingUpdateCompleted,
    UpgradeCompleted,
    UpgradeFailed,
    /// Any other task type ended in an error
    TaskFailed,
}

impl EventKind {
    /// Event reason as shown by `kubectl describe`
    pub fn reason(&self) -> &'static str {
        match self {
            EventKind::CloneStepCompleted => "CloneStepCompleted",
            EventKind::CloneFailed => "CloneFailed",
            EventKind::FailoverCompleted => "FailoverCompleted",
            EventKind::StandbyEnabled => "StandbyEnabled",
            EventKind::StandbyDisabled => "StandbyDisabled",
            EventKind::ClusterShutdown => "ClusterShutdown",
            EventKind::ClusterStartup => "ClusterStartup",
            EventKind::RollingUpdateCompleted => "RollingUpdateCompleted",
            EventKind::UpgradeCompleted => "UpgradeCompleted",
            EventKind::UpgradeFailed => "UpgradeFailed",
            EventKind::TaskFailed => "TaskFailed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventKind::CloneFailed | EventKind::UpgradeFailed | EventKind::TaskFailed
        )
    }

    fn action(&self) -> &'static str {
        match self {
            EventKind::CloneStepCompleted | EventKind::CloneFailed => "Clone",
            EventKind::FailoverCompleted => "Failover",
            EventKind::StandbyEnabled | EventKind::StandbyDisabled => "ToggleStandby",
            EventKind::ClusterShutdown => "Shutdown",
            EventKind::ClusterStartup => "Startup",
            EventKind::RollingUpdateCompleted => "RollingUpdate",
            EventKind::UpgradeCompleted | EventKind::UpgradeFailed => "Upgrade",
            EventKind::TaskFailed => "Task",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// A notification about a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationEvent {
    pub kind: EventKind,
    pub namespace: String,
    pub cluster: String,
    pub message: String,
}

impl OrchestrationEvent {
    pub fn new(
        kind: EventKind,
        namespace: impl Into<String>,
        cluster: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            cluster: cluster.into(),
            message: message.into(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OrchestrationEvent) -> Result<()>;
}

/// Publish an event, logging instead of failing when delivery does not work
pub async fn publish(publisher: &dyn EventPublisher, event: OrchestrationEvent) {
    if let Err(e) = publisher.publish(&event).await {
        warn!(
            kind = %event.kind,
            cluster = %event.cluster,
            error = %e,
            "failed to publish event"
        );
    }
}

/// [`EventPublisher`] that records Kubernetes Events against the PgCluster
#[derive(Clone)]
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn cluster_reference(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(PgCluster::api_version(&()).to_string()),
        kind: Some(PgCluster::kind(&()).to_string()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, event: &OrchestrationEvent) -> Result<()> {
        let type_ = if event.kind.is_failure() {
            EventType::Warning
        } else {
            EventType::Normal
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: event.kind.reason().into(),
                    note: Some(event.message.clone()),
                    action: event.kind.action().into(),
                    secondary: None,
                },
                &cluster_reference(&event.namespace, &event.cluster),
            )
            .await?;
        Ok(())
    }
}
