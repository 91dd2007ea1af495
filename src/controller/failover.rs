//! Controlled promotion of a chosen replica
//!
//! Promotion itself belongs to Patroni: the operator asks for it and then points
//! routing labels and the cluster's `current-primary` annotation at the target.
//! A failed promotion request is only a warning because Patroni may still finish
//! it; failures while repointing metadata are returned to the caller.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::controller::classify::live_primary_selector;
use crate::controller::status::mark_task_completed;
use crate::controller::{Context, Error, Result};
use crate::crd::{PgCluster, PgTask};
use crate::resources::common::{
    ANNOTATION_CURRENT_PRIMARY, LABEL_DEPLOYMENT_NAME, LABEL_SERVICE_NAME, ResourceMeta, Selector,
    primary_service_name,
};
use crate::resources::events::{EventKind, OrchestrationEvent, publish};
use crate::resources::patroni::{DATABASE_CONTAINER, failover_command};

/// The instance chosen for promotion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverTarget {
    pub deployment: String,
    pub pod: String,
}

/// Resolve `target` as a deployment name, or failing that as a pod name
pub async fn resolve_target(
    ctx: &Context,
    namespace: &str,
    target: &str,
) -> Result<FailoverTarget> {
    if ctx.store.get_deployment(namespace, target).await?.is_some() {
        let pods = ctx
            .store
            .list_pods(
                namespace,
                &Selector::default()
                    .with(LABEL_DEPLOYMENT_NAME, target)
                    .running(),
            )
            .await?;
        let pod = pods
            .first()
            .map(|p| p.name_any())
            .ok_or_else(|| Error::NotFound(format!("running pod of deployment {}", target)))?;
        return Ok(FailoverTarget {
            deployment: target.to_string(),
            pod,
        });
    }

    let pod = ctx
        .store
        .get_pod(namespace, target)
        .await?
        .ok_or_else(|| Error::NotFound(format!("failover target {}", target)))?;
    let deployment = ResourceMeta::of(&pod.metadata)
        .deployment_name()
        .ok_or_else(|| {
            Error::ValidationError(format!("pod {} has no {} label", target, LABEL_DEPLOYMENT_NAME))
        })?
        .to_string();
    Ok(FailoverTarget {
        deployment,
        pod: pod.name_any(),
    })
}

async fn request_promotion(ctx: &Context, namespace: &str, cluster_name: &str, candidate: &str) {
    let primaries: Vec<Pod> = match ctx
        .store
        .list_pods(namespace, &live_primary_selector(cluster_name))
        .await
    {
        Ok(pods) => pods,
        Err(e) => {
            warn!(error = %e, "could not find the current primary; leaving promotion to Patroni");
            return;
        }
    };
    let Some(primary) = primaries.first() else {
        warn!("no running primary pod; leaving promotion to Patroni");
        return;
    };

    let primary_pod = primary.name_any();
    match ctx
        .executor
        .exec(
            namespace,
            &primary_pod,
            DATABASE_CONTAINER,
            &failover_command(candidate),
            None,
        )
        .await
    {
        Ok(output) => info!(primary = %primary_pod, candidate, stdout = %output.stdout.trim(), "promotion requested"),
        Err(e) => warn!(primary = %primary_pod, candidate, error = %e, "promotion request failed"),
    }
}

/// Promote `target` to primary of `cluster` and complete `task`
#[instrument(skip(ctx, cluster, task), fields(cluster = %cluster.name_any()))]
pub async fn failover(ctx: &Context, target: &str, cluster: &PgCluster, task: &PgTask) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    let target = resolve_target(ctx, &namespace, target).await?;
    info!(deployment = %target.deployment, pod = %target.pod, "failing over");

    request_promotion(ctx, &namespace, &cluster_name, &target.pod).await;

    // The pod may have changed while Patroni promoted it
    let pod = ctx
        .store
        .get_pod(&namespace, &target.pod)
        .await?
        .ok_or_else(|| Error::NotFound(format!("pod {}", target.pod)))?;

    let relabel = json!({
        "metadata": { "labels": { LABEL_SERVICE_NAME: primary_service_name(&cluster_name) } }
    });
    ctx.store
        .patch_pod(&namespace, &pod.name_any(), &relabel)
        .await?;
    ctx.store
        .patch_deployment(&namespace, &target.deployment, &relabel)
        .await?;

    let annotate = json!({
        "metadata": { "annotations": { ANNOTATION_CURRENT_PRIMARY: target.deployment } }
    });
    ctx.store
        .patch_cluster(&namespace, &cluster_name, &annotate)
        .await?;

    mark_task_completed(
        ctx.store.as_ref(),
        task,
        &format!("Promoted {}", target.deployment),
    )
    .await?;

    publish(
        ctx.events.as_ref(),
        OrchestrationEvent::new(
            EventKind::FailoverCompleted,
            &namespace,
            &cluster_name,
            format!("Failover to {} completed", target.deployment),
        ),
    )
    .await;
    Ok(())
}
