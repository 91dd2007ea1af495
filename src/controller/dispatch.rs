//! PgTask reconciliation: route each task to the operation it names
//!
//! Clone steps and upgrades report their own failures and are not requeued.
//! Every other task publishes a task-failure event and is requeued with
//! backoff when it fails.

use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::clone::run_clone_step;
use crate::controller::failover::failover;
use crate::controller::rolling::rolling_update;
use crate::controller::scale::{shutdown, startup};
use crate::controller::standby::{disable_standby, enable_standby};
use crate::controller::status::{mark_task_completed, mark_task_in_progress};
use crate::controller::upgrade::run_upgrade;
use crate::controller::{BackoffConfig, Context, Error, Result};
use crate::crd::{PgCluster, PgTask, TaskType, params};
use crate::resources::ResourceMeta;
use crate::resources::common::ANNOTATION_RESTARTED_AT;
use crate::resources::events::{EventKind, OrchestrationEvent, publish};

/// Stamp `restarted-at` on the pod template so the deployment rolls its pod
pub fn stamp_restart(deployment: &mut Deployment, restarted_at: &str) -> Result<()> {
    let name = deployment.name_any();
    let spec = deployment
        .spec
        .as_mut()
        .ok_or_else(|| Error::ValidationError(format!("deployment {} has no spec", name)))?;
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_RESTARTED_AT.to_string(), restarted_at.to_string());
    Ok(())
}

/// Cluster a task operates on, from its parameters or its `pg-cluster` label
async fn task_cluster(ctx: &Context, task: &PgTask) -> Result<PgCluster> {
    let namespace = task.namespace().unwrap_or_default();
    let name = task
        .param(params::CLUSTER)
        .or_else(|| ResourceMeta::of(&task.metadata).cluster())
        .filter(|n| !n.is_empty())
        .ok_or(Error::MissingParameter(params::CLUSTER))?;
    ctx.store
        .get_cluster(&namespace, name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("cluster {}", name)))
}

async fn execute_task(ctx: &Context, task: &PgTask) -> Result<()> {
    let task_type = task.spec.task_type;
    match task_type {
        TaskType::CloneStep1 | TaskType::CloneStep2 | TaskType::CloneStep3 => {
            return run_clone_step(ctx, task).await;
        }
        TaskType::Upgrade => return run_upgrade(ctx, task).await,
        TaskType::Workflow => return Ok(()),
        _ => {}
    }

    let cluster = task_cluster(ctx, task).await?;

    if task_type == TaskType::Failover {
        let target = task
            .param(params::FAILOVER_TARGET)
            .filter(|t| !t.is_empty())
            .ok_or(Error::MissingParameter(params::FAILOVER_TARGET))?;
        mark_task_in_progress(ctx.store.as_ref(), task).await?;
        // Completes the task itself
        return failover(ctx, target, &cluster, task).await;
    }

    mark_task_in_progress(ctx.store.as_ref(), task).await?;
    match task_type {
        TaskType::Shutdown => shutdown(ctx, &cluster).await?,
        TaskType::Startup => startup(ctx, &cluster).await?,
        TaskType::EnableStandby => enable_standby(ctx, &cluster).await?,
        TaskType::DisableStandby => disable_standby(ctx, &cluster).await?,
        TaskType::Restart => {
            let restarted_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            rolling_update(ctx, &cluster, move |_, deployment| {
                stamp_restart(deployment, &restarted_at)
            })
            .await?
        }
        other => {
            return Err(Error::InvalidTask(format!("no handler for {} tasks", other)));
        }
    }
    mark_task_completed(ctx.store.as_ref(), task, &format!("{} completed", task_type)).await?;
    Ok(())
}

/// Reconcile one PgTask
#[instrument(skip(task, ctx), fields(task = %task.name_any(), task_type = %task.spec.task_type))]
pub async fn reconcile_task(task: Arc<PgTask>, ctx: Arc<Context>) -> Result<Action> {
    if task.is_completed() || task.is_failed() || task.spec.task_type == TaskType::Workflow {
        debug!("nothing to do");
        return Ok(Action::await_change());
    }

    let namespace = task.namespace().unwrap_or_default();
    let task_type = task.spec.task_type.as_str();
    if let Some(health) = &ctx.health_state {
        health.touch();
        health.metrics.task_started();
    }

    let start = Instant::now();
    let result = execute_task(&ctx, &task).await;

    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .record_task(&namespace, task_type, start.elapsed().as_secs_f64());
        if result.is_err() {
            health.metrics.record_error(&namespace, task_type);
        }
    }

    match result {
        Ok(()) => {
            info!(elapsed = ?start.elapsed(), "task finished");
            Ok(Action::await_change())
        }
        Err(e) if task.spec.task_type.is_clone_step() || task.spec.task_type == TaskType::Upgrade => {
            // Left incomplete for inspection; a failure event has been published
            warn!(error = %e, "task failed; not retrying");
            Ok(Action::await_change())
        }
        Err(e) => {
            let cluster = task
                .param(params::CLUSTER)
                .or_else(|| ResourceMeta::of(&task.metadata).cluster())
                .unwrap_or_default()
                .to_string();
            publish(
                ctx.events.as_ref(),
                OrchestrationEvent::new(
                    EventKind::TaskFailed,
                    &namespace,
                    cluster,
                    format!("{} failed: {}", task.spec.task_type, e),
                ),
            )
            .await;
            Err(e)
        }
    }
}

/// Requeue a failed task with backoff
pub fn error_policy(task: Arc<PgTask>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    if error.is_retryable() {
        warn!(task = %task.name_any(), error = %error, ?delay, "retryable task error; requeuing");
    } else {
        error!(task = %task.name_any(), error = %error, ?delay, "task error; requeuing for manual intervention");
    }
    Action::requeue(delay)
}
