//! Rolling application of a deployment mutation across a cluster
//!
//! Replicas are updated one at a time while the primary keeps serving. Only
//! when every replica has been handled is the primary demoted through a planned
//! switchover and then updated itself. None of these steps may run concurrently.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use crate::controller::classify::classify;
use crate::controller::wait::{wait_accepting_connections, wait_ready};
use crate::controller::{Context, Result};
use crate::crd::PgCluster;
use crate::resources::common::{LABEL_DEPLOYMENT_NAME, Selector};
use crate::resources::events::{EventKind, OrchestrationEvent, publish};
use crate::resources::patroni::{DATABASE_CONTAINER, stop_postgres_command, switchover_command};

/// Name of a running pod of deployment `name`, if there is one
async fn running_pod(ctx: &Context, namespace: &str, name: &str) -> Result<Option<String>> {
    let pods = ctx
        .store
        .list_pods(
            namespace,
            &Selector::default().with(LABEL_DEPLOYMENT_NAME, name).running(),
        )
        .await?;
    Ok(pods.first().map(|p| p.name_any()))
}

/// Cleanly stop PostgreSQL in the deployment's pod so it restarts without crash recovery
async fn stop_database(ctx: &Context, namespace: &str, name: &str) {
    let pod = match running_pod(ctx, namespace, name).await {
        Ok(Some(pod)) => pod,
        Ok(None) => {
            warn!(deployment = name, "no running pod to stop");
            return;
        }
        Err(e) => {
            warn!(deployment = name, error = %e, "could not find pod to stop");
            return;
        }
    };
    if let Err(e) = ctx
        .executor
        .exec(namespace, &pod, DATABASE_CONTAINER, &stop_postgres_command(), None)
        .await
    {
        warn!(deployment = name, pod = %pod, error = %e, "failed to stop database cleanly");
    }
}

/// Ask Patroni to move leadership away from `primary`
async fn switchover(ctx: &Context, namespace: &str, primary: &str) {
    let pod = match running_pod(ctx, namespace, primary).await {
        Ok(Some(pod)) => pod,
        Ok(None) => {
            warn!(primary, "primary has no running pod; skipping switchover");
            return;
        }
        Err(e) => {
            warn!(primary, error = %e, "could not find primary pod; skipping switchover");
            return;
        }
    };
    match ctx
        .executor
        .exec(namespace, &pod, DATABASE_CONTAINER, &switchover_command(&pod), None)
        .await
    {
        Ok(_) => info!(primary, pod = %pod, "switchover completed"),
        Err(e) => warn!(primary, pod = %pod, error = %e, "switchover failed"),
    }
}

/// Apply `mutate` to every database deployment of `cluster`
///
/// Mutation or persistence failures skip that instance; readiness waits only
/// warn. Only a failure to classify the cluster is returned.
#[instrument(skip(ctx, cluster, mutate), fields(cluster = %cluster.name_any()))]
pub async fn rolling_update<F>(ctx: &Context, cluster: &PgCluster, mutate: F) -> Result<()>
where
    F: Fn(&PgCluster, &mut Deployment) -> Result<()> + Send + Sync,
{
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let wait = &ctx.config.wait;
    let port = if cluster.spec.port.is_empty() {
        ctx.config.db_port.as_str()
    } else {
        cluster.spec.port.as_str()
    };

    let classification = classify(ctx.store.as_ref(), &namespace, &cluster_name).await?;
    info!(
        primaries = ?classification.primary_names(),
        replicas = ?classification.replica_names(),
        "starting rolling update"
    );

    for replica in &classification.replicas {
        let name = replica.name_any();
        let mut deployment = replica.clone();
        if let Err(e) = mutate(cluster, &mut deployment) {
            warn!(deployment = %name, error = %e, "mutation failed; skipping instance");
            continue;
        }

        stop_database(ctx, &namespace, &name).await;

        if let Err(e) = ctx.store.replace_deployment(&namespace, &deployment).await {
            warn!(deployment = %name, error = %e, "failed to update deployment");
            continue;
        }

        if let Err(e) = wait_ready(
            ctx.store.as_ref(),
            &namespace,
            &name,
            wait.period(),
            wait.ready_timeout(),
        )
        .await
        {
            warn!(deployment = %name, error = %e, "replica did not become ready");
        }

        if let Err(e) = wait_accepting_connections(
            ctx.store.as_ref(),
            ctx.executor.as_ref(),
            &namespace,
            &name,
            port,
            wait.period(),
            wait.connect_timeout(),
        )
        .await
        {
            warn!(deployment = %name, error = %e, "replica is not accepting connections");
        }
    }

    match classification.sole_primary() {
        Ok(primary) if !classification.replicas.is_empty() => {
            switchover(ctx, &namespace, &primary.name_any()).await;
        }
        Ok(_) => info!("no replicas; skipping switchover"),
        Err(e) => info!(error = %e, "skipping switchover; leaving failover to Patroni"),
    }

    for primary in &classification.primaries {
        let name = primary.name_any();
        let mut deployment = primary.clone();
        if let Err(e) = mutate(cluster, &mut deployment) {
            warn!(deployment = %name, error = %e, "mutation failed; skipping instance");
            continue;
        }
        if let Err(e) = ctx.store.replace_deployment(&namespace, &deployment).await {
            warn!(deployment = %name, error = %e, "failed to update deployment");
        }
    }

    publish(
        ctx.events.as_ref(),
        OrchestrationEvent::new(
            EventKind::RollingUpdateCompleted,
            &namespace,
            &cluster_name,
            format!(
                "Rolling update of {} instances completed",
                classification.replicas.len() + classification.primaries.len()
            ),
        ),
    )
    .await;
    Ok(())
}
