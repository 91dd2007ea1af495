//! Status updates for cluster and task records

use tracing::{debug, info};

use crate::controller::Result;
use crate::controller::state_machine::{TaskEvent, TaskStateMachine, TransitionResult};
use crate::crd::{ClusterState, PgClusterStatus, PgTask, PgTaskStatus};
use crate::resources::ClusterStore;
use kube::ResourceExt;

/// Set the cluster's status state and message
pub async fn set_cluster_state(
    store: &dyn ClusterStore,
    namespace: &str,
    cluster_name: &str,
    state: ClusterState,
    message: &str,
) -> Result<()> {
    debug!(cluster = cluster_name, %state, "setting cluster state");
    store
        .patch_cluster_status(
            namespace,
            cluster_name,
            &PgClusterStatus {
                state,
                message: message.to_string(),
            },
        )
        .await
}

/// Move a task forward through its lifecycle
///
/// Returns false, without writing anything, when `event` is not legal from the
/// task's current state.
pub async fn advance_task(
    store: &dyn ClusterStore,
    task: &PgTask,
    event: TaskEvent,
    message: &str,
) -> Result<bool> {
    let namespace = task.namespace().unwrap_or_default();
    let name = task.name_any();
    match TaskStateMachine::new().transition(task.state(), event) {
        TransitionResult::Success {
            from,
            to,
            description,
            ..
        } => {
            info!(task = %name, %from, %to, description, "task transition");
            store
                .patch_task_status(
                    &namespace,
                    &name,
                    &PgTaskStatus {
                        state: to,
                        message: message.to_string(),
                        failed: false,
                    },
                )
                .await?;
            Ok(true)
        }
        TransitionResult::InvalidTransition { current, event } => {
            debug!(task = %name, %current, %event, "ignoring task transition");
            Ok(false)
        }
    }
}

pub async fn mark_task_in_progress(store: &dyn ClusterStore, task: &PgTask) -> Result<bool> {
    advance_task(store, task, TaskEvent::Started, "").await
}

pub async fn mark_task_completed(
    store: &dyn ClusterStore,
    task: &PgTask,
    message: &str,
) -> Result<bool> {
    advance_task(store, task, TaskEvent::Finished, message).await
}

/// Record a failed run without moving the task state
///
/// The state is taken from the stored record, since the run may have advanced
/// it past what `task` carries.
pub async fn mark_task_failed(store: &dyn ClusterStore, task: &PgTask, message: &str) -> Result<()> {
    let namespace = task.namespace().unwrap_or_default();
    let name = task.name_any();
    let state = store
        .get_task(&namespace, &name)
        .await?
        .map(|t| t.state())
        .unwrap_or_else(|| task.state());
    info!(task = %name, %state, "marking task failed");
    store
        .patch_task_status(
            &namespace,
            &name,
            &PgTaskStatus {
                state,
                message: message.to_string(),
                failed: true,
            },
        )
        .await
}
