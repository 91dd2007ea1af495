//! Switching a cluster between normal and standby operation
//!
//! A standby cluster replays WAL from a remote backup repository. Enabling it
//! requires a shut-down cluster because the data volumes are recreated empty and
//! Patroni's configuration is rewritten underneath the instances.

use kube::ResourceExt;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::controller::primary::{PrimaryEvidence, RESOLVERS, first_non_empty};
use crate::controller::wait::wait_pvc_deleted;
use crate::controller::{Context, Error, Result};
use crate::crd::{BackrestStorageType, ClusterState, PgCluster};
use crate::resources::common::Selector;
use crate::resources::events::{EventKind, OrchestrationEvent, publish};
use crate::resources::patroni::{
    DCS_CONFIG_ANNOTATION, PGHA_BOOTSTRAP_REPO_TYPE, add_standby_section, dcs_config,
    dcs_config_map_name, leader_config_map_name, pgha_config_map_name, pgha_dcs_snapshot_key,
    remove_standby_section,
};
use crate::resources::pvc::{classify_volume, generate_pvc, storage_for_role};

fn is_shutdown(cluster: &PgCluster) -> bool {
    cluster
        .status
        .as_ref()
        .is_some_and(|s| s.state == ClusterState::Shutdown)
}

/// Delete every volume of the cluster and recreate it empty from the cluster's storage spec
async fn recreate_volumes(ctx: &Context, cluster: &PgCluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let wait = &ctx.config.wait;
    let primary = first_non_empty(&PrimaryEvidence::from_cluster(cluster), RESOLVERS, &cluster_name);

    let pvcs = ctx
        .store
        .list_pvcs(&namespace, &Selector::cluster(&cluster_name))
        .await?;

    let names: Vec<String> = pvcs.iter().map(|p| p.name_any()).collect();
    for name in &names {
        info!(volume = %name, "deleting volume");
        ctx.store.delete_pvc(&namespace, name).await?;
        if let Err(e) = wait_pvc_deleted(
            ctx.store.as_ref(),
            &namespace,
            name,
            wait.period(),
            wait.delete_timeout(),
        )
        .await
        {
            warn!(volume = %name, error = %e, "volume still present");
        }
    }

    for name in &names {
        let role = classify_volume(name, &cluster_name, &primary);
        let Some(storage) = storage_for_role(cluster, &role) else {
            warn!(volume = %name, ?role, "no storage spec for volume; not recreating");
            continue;
        };
        info!(volume = %name, ?role, "recreating volume");
        ctx.store
            .create_pvc(&namespace, &generate_pvc(name, &cluster_name, &namespace, storage))
            .await?;
    }
    Ok(())
}

/// Rewrite the DCS configuration document, if the transform changes it
async fn rewrite_dcs_config<F>(ctx: &Context, namespace: &str, cluster_name: &str, transform: F) -> Result<()>
where
    F: FnOnce(&str) -> std::result::Result<Option<String>, serde_json::Error>,
{
    let name = dcs_config_map_name(cluster_name);
    let Some(config_map) = ctx.store.get_configmap(namespace, &name).await? else {
        warn!(config_map = %name, "DCS configuration not found");
        return Ok(());
    };
    let current = dcs_config(&config_map).unwrap_or_default();
    if let Some(updated) = transform(current)? {
        let patch = json!({ "metadata": { "annotations": { DCS_CONFIG_ANNOTATION: updated } } });
        ctx.store.patch_configmap(namespace, &name, &patch).await?;
    }
    Ok(())
}

async fn set_standby_flag(ctx: &Context, namespace: &str, cluster_name: &str, standby: bool) -> Result<()> {
    ctx.store
        .patch_cluster(namespace, cluster_name, &json!({ "spec": { "standby": standby } }))
        .await
}

/// Turn a shut-down cluster into a standby of its remote repository
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn enable_standby(ctx: &Context, cluster: &PgCluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    if !is_shutdown(cluster) {
        return Err(Error::ClusterNotShutdown(cluster_name));
    }
    let repo_type: BackrestStorageType = cluster.spec.remote_storage_type().ok_or_else(|| {
        Error::ValidationError(format!(
            "cluster {} has no remote backup storage to stream from",
            cluster_name
        ))
    })?;

    recreate_volumes(ctx, cluster).await?;

    rewrite_dcs_config(ctx, &namespace, &cluster_name, |config| {
        add_standby_section(config, repo_type)
    })
    .await?;

    if let Err(e) = ctx
        .store
        .delete_configmap(&namespace, &leader_config_map_name(&cluster_name))
        .await
    {
        warn!(error = %e, "failed to delete leader record");
    }

    let mut data = serde_json::Map::new();
    data.insert(
        PGHA_BOOTSTRAP_REPO_TYPE.to_string(),
        Value::String(repo_type.to_string()),
    );
    data.insert(pgha_dcs_snapshot_key(&cluster_name), Value::Null);
    ctx.store
        .patch_configmap(
            &namespace,
            &pgha_config_map_name(&cluster_name),
            &json!({ "data": data }),
        )
        .await?;

    set_standby_flag(ctx, &namespace, &cluster_name, true).await?;

    publish(
        ctx.events.as_ref(),
        OrchestrationEvent::new(
            EventKind::StandbyEnabled,
            &namespace,
            &cluster_name,
            format!("Standby enabled for {} from {} repository", cluster_name, repo_type),
        ),
    )
    .await;
    Ok(())
}

/// Return a standby cluster to normal operation
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn disable_standby(ctx: &Context, cluster: &PgCluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    rewrite_dcs_config(ctx, &namespace, &cluster_name, remove_standby_section).await?;

    ctx.store
        .patch_configmap(
            &namespace,
            &pgha_config_map_name(&cluster_name),
            &json!({ "data": { PGHA_BOOTSTRAP_REPO_TYPE: null } }),
        )
        .await?;

    set_standby_flag(ctx, &namespace, &cluster_name, false).await?;

    publish(
        ctx.events.as_ref(),
        OrchestrationEvent::new(
            EventKind::StandbyDisabled,
            &namespace,
            &cluster_name,
            format!("Standby disabled for {}", cluster_name),
        ),
    )
    .await;
    Ok(())
}
