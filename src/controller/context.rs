use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::health::HealthState;
use crate::resources::{
    ClusterStore, EventPublisher, KubeEventPublisher, KubePodExecutor, KubeStore, PodExecutor,
};

/// Reporter name on published events
pub const CONTROLLER_NAME: &str = "postgres-ha-operator";

/// Shared context for every orchestration call
///
/// The collaborators are trait objects so orchestration can run against the
/// API server or against in-memory fakes.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ClusterStore>,
    pub executor: Arc<dyn PodExecutor>,
    pub events: Arc<dyn EventPublisher>,
    pub config: Arc<OperatorConfig>,
    /// Health state for recording metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            store: Arc::new(KubeStore::new(client.clone())),
            executor: Arc::new(KubePodExecutor::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            config: Arc::new(config),
            health_state,
        }
    }

    /// Context over explicit collaborators
    pub fn with_parts(
        store: Arc<dyn ClusterStore>,
        executor: Arc<dyn PodExecutor>,
        events: Arc<dyn EventPublisher>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            executor,
            events,
            config: Arc::new(config),
            health_state: None,
        }
    }
}
