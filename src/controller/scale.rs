//! Per-role deployment scaling, and cluster shutdown/startup built on it

use kube::ResourceExt;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::controller::classify::classify;
use crate::controller::status::set_cluster_state;
use crate::controller::{Context, Result};
use crate::crd::{ClusterState, PgCluster};
use crate::resources::common::{ANNOTATION_CURRENT_PRIMARY, InstanceRole, ResourceMeta, Selector};
use crate::resources::events::{EventKind, OrchestrationEvent, publish};
use crate::resources::patroni::{PGHA_AUTOFAIL, leader_config_map_name, pgha_config_map_name};

/// Which roles a scale call touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleTargets {
    pub primary: bool,
    pub replicas: bool,
    pub repo: bool,
    pub proxy: bool,
}

impl ScaleTargets {
    pub const ALL: ScaleTargets = ScaleTargets {
        primary: true,
        replicas: true,
        repo: true,
        proxy: true,
    };

    /// Everything except replicas, which stay down until the primary is healthy
    pub const STARTUP: ScaleTargets = ScaleTargets {
        primary: true,
        replicas: false,
        repo: true,
        proxy: true,
    };

    fn includes(&self, role: InstanceRole) -> bool {
        match role {
            InstanceRole::Primary => self.primary,
            InstanceRole::Replica => self.replicas,
            InstanceRole::Repository => self.repo,
            InstanceRole::Proxy => self.proxy,
        }
    }
}

/// Deployment names found per role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleSummary {
    pub primary: Vec<String>,
    pub replicas: Vec<String>,
    pub repos: Vec<String>,
    pub proxies: Vec<String>,
}

impl ScaleSummary {
    fn record(&mut self, role: InstanceRole, name: String) {
        match role {
            InstanceRole::Primary => self.primary.push(name),
            InstanceRole::Replica => self.replicas.push(name),
            InstanceRole::Repository => self.repos.push(name),
            InstanceRole::Proxy => self.proxies.push(name),
        }
    }
}

/// Set the replica count of every included role's deployments to `desired`
///
/// The proxy keeps its configured multiplicity when scaling up. A failure to
/// scale one deployment is logged and the rest are still scaled.
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn scale_cluster_deployments(
    ctx: &Context,
    cluster: &PgCluster,
    desired: i32,
    targets: ScaleTargets,
) -> Result<ScaleSummary> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    let deployments = ctx
        .store
        .list_deployments(&namespace, &Selector::cluster(&cluster_name))
        .await?;

    let mut summary = ScaleSummary::default();
    for deployment in deployments {
        let name = deployment.name_any();
        let Some(role) = ResourceMeta::of(&deployment.metadata).role(&cluster_name) else {
            continue;
        };
        summary.record(role, name.clone());

        if !targets.includes(role) {
            continue;
        }

        let replicas = if role == InstanceRole::Proxy && desired > 0 {
            cluster.spec.pgbouncer.replicas
        } else {
            desired
        };

        info!(deployment = %name, %role, replicas, "scaling deployment");
        if let Err(e) = ctx
            .store
            .scale_deployment(&namespace, &name, replicas)
            .await
        {
            warn!(deployment = %name, error = %e, "failed to scale deployment");
        }
    }

    Ok(summary)
}

async fn set_autofail(ctx: &Context, namespace: &str, cluster_name: &str, enabled: bool) {
    let patch = json!({ "data": { PGHA_AUTOFAIL: enabled.to_string() } });
    if let Err(e) = ctx
        .store
        .patch_configmap(namespace, &pgha_config_map_name(cluster_name), &patch)
        .await
    {
        warn!(cluster = cluster_name, enabled, error = %e, "failed to set autofail");
    }
}

/// Stop every instance of a cluster while remembering its primary
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn shutdown(ctx: &Context, cluster: &PgCluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    // Patroni must not promote anything while the instances go away
    set_autofail(ctx, &namespace, &cluster_name, false).await;

    let classification = classify(ctx.store.as_ref(), &namespace, &cluster_name).await?;
    match classification.sole_primary() {
        Ok(primary) => {
            let patch = json!({
                "metadata": { "annotations": { ANNOTATION_CURRENT_PRIMARY: primary.name_any() } }
            });
            ctx.store
                .patch_cluster(&namespace, &cluster_name, &patch)
                .await?;
        }
        Err(e) => warn!(error = %e, "keeping the recorded primary"),
    }

    let summary = scale_cluster_deployments(ctx, cluster, 0, ScaleTargets::ALL).await?;
    info!(?summary, "cluster scaled down");

    if let Err(e) = ctx
        .store
        .delete_configmap(&namespace, &leader_config_map_name(&cluster_name))
        .await
    {
        warn!(error = %e, "failed to delete leader record");
    }

    set_cluster_state(
        ctx.store.as_ref(),
        &namespace,
        &cluster_name,
        ClusterState::Shutdown,
        "Cluster shut down",
    )
    .await?;

    publish(
        ctx.events.as_ref(),
        OrchestrationEvent::new(
            EventKind::ClusterShutdown,
            &namespace,
            &cluster_name,
            format!("Cluster {} shut down", cluster_name),
        ),
    )
    .await;
    Ok(())
}

/// Bring a shut-down cluster back with its previous primary
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn startup(ctx: &Context, cluster: &PgCluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    set_autofail(ctx, &namespace, &cluster_name, true).await;

    let summary = scale_cluster_deployments(ctx, cluster, 1, ScaleTargets::STARTUP).await?;
    info!(?summary, "cluster scaled up");

    // A started cluster no longer qualifies for shutdown-only operations
    set_cluster_state(
        ctx.store.as_ref(),
        &namespace,
        &cluster_name,
        ClusterState::Initialized,
        "Cluster started",
    )
    .await?;

    publish(
        ctx.events.as_ref(),
        OrchestrationEvent::new(
            EventKind::ClusterStartup,
            &namespace,
            &cluster_name,
            format!("Cluster {} started", cluster_name),
        ),
    )
    .await;
    Ok(())
}
