pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, Result, disable_standby, enable_standby, error_policy, failover,
    reconcile_task, rolling_update, run_clone_step, run_upgrade, scale_cluster_deployments,
    shutdown, startup,
};
pub use crd::{PgCluster, PgReplica, PgTask};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client};

/// Run the task controller.
///
/// Watches PgTask resources and dispatches each task to the orchestration
/// operation it names. When `namespace` is `Some(ns)`, only tasks in that
/// namespace are watched.
pub async fn run_task_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    tracing::info!(
        "Starting controller for PgTask resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    if let Some(ref state) = health_state {
        state.set_ready(true);
    }

    let ctx = Arc::new(Context::new(client.clone(), config, health_state));

    let tasks: Api<PgTask> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    Controller::new(tasks, WatcherConfig::default().any_semantic())
        .run(reconcile_task, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled task: {}", obj.name);
                }
                Err(e) => {
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Task no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Task reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::error!("Task controller stream ended unexpectedly");
}
