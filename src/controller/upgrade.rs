//! In-place migration of a cluster created by an older operator release
//!
//! The old cluster's objects are torn down and its record is resubmitted in
//! the current format, keeping the data volume of the primary. Every teardown
//! action is best-effort: a migration that stops after deleting the cluster
//! record but before recreating it leaves the cluster without any record at all.

use std::collections::BTreeMap;

use kube::ResourceExt;
use kube::core::ObjectMeta;
use tracing::{info, instrument, warn};

use crate::config::OperatorConfig;
use crate::controller::cleanup::CleanupLog;
use crate::controller::primary::resolve_primary;
use crate::controller::status::{mark_task_completed, mark_task_failed, mark_task_in_progress};
use crate::controller::wait::wait_deployment_deleted;
use crate::controller::workflow::{create_workflow_task, steps, update_workflow};
use crate::controller::{Context, Error, Result};
use crate::crd::{PgCluster, PgTask, TaskType, params};
use crate::resources::backrest::{backrest_repo_name, backrest_repo_secret_name};
use crate::resources::common::{
    ANNOTATION_CURRENT_PRIMARY, ANNOTATION_UPGRADE_FROM, ANNOTATION_UPGRADE_TO, LABEL_AUTOFAIL,
    LABEL_DEPLOYMENT_NAME, LABEL_EXPORTER, LABEL_PG_CLUSTER, LABEL_PGO_VERSION, LABEL_WORKFLOW_ID,
    LEGACY_LABEL_COLLECT, OBSOLETE_LABELS, ResourceMeta, Selector,
};
use crate::resources::events::{EventKind, OrchestrationEvent, publish};
use crate::resources::patroni::{
    dcs_config_map_name, generate_pgha_config_map, leader_config_map_name,
    pgha_config_map_name,
};
use crate::resources::pvc::data_volume_name;
use crate::resources::secret::migrate_repo_secret;

/// Workflow type of the record that tracks the resubmitted cluster
pub const RECREATE_WORKFLOW: &str = "createcluster";

/// Image names of older releases and their HA replacements
const IMAGE_REMAP: &[(&str, &str)] = &[
    ("crunchy-postgres", "crunchy-postgres-ha"),
    ("crunchy-postgres-gis", "crunchy-postgres-gis-ha"),
];

pub fn remap_image(image: &str) -> &str {
    IMAGE_REMAP
        .iter()
        .find(|(old, _)| *old == image)
        .map(|(_, new)| *new)
        .unwrap_or(image)
}

fn backfill(field: &mut String, default: &str) {
    if field.is_empty() {
        *field = default.to_string();
    }
}

/// The cluster record to resubmit after teardown
///
/// `replicas` is the number of replica records removed during the migration;
/// the old spec's replica count is not trusted.
pub fn upgraded_cluster(
    cluster: &PgCluster,
    primary: &str,
    replicas: usize,
    ccp_image_tag: Option<&str>,
    config: &OperatorConfig,
) -> PgCluster {
    let mut spec = cluster.spec.clone();
    let mut labels = cluster.labels().clone();
    let mut annotations = cluster.annotations().clone();

    let from_version = labels.get(LABEL_PGO_VERSION).cloned().unwrap_or_default();
    labels.insert(LABEL_PGO_VERSION.to_string(), config.operator_version.clone());

    if let Some(collect) = labels.remove(LEGACY_LABEL_COLLECT) {
        labels.insert(LABEL_EXPORTER.to_string(), collect);
    }
    for obsolete in OBSOLETE_LABELS {
        labels.remove(*obsolete);
    }
    labels.insert(LABEL_DEPLOYMENT_NAME.to_string(), primary.to_string());
    labels.insert(LABEL_AUTOFAIL.to_string(), "true".to_string());

    spec.ccp_image = remap_image(&spec.ccp_image).to_string();
    spec.ccp_image_tag = ccp_image_tag
        .filter(|t| !t.is_empty())
        .unwrap_or(&config.ccp_image_tag)
        .to_string();
    spec.replicas = replicas.to_string();

    let s3 = &config.backrest_s3;
    backfill(&mut spec.backrest_s3_bucket, &s3.bucket);
    backfill(&mut spec.backrest_s3_endpoint, &s3.endpoint);
    backfill(&mut spec.backrest_s3_region, &s3.region);
    backfill(&mut spec.backrest_s3_uri_style, &s3.uri_style);
    backfill(&mut spec.backrest_s3_verify_tls, &s3.verify_tls);

    annotations.insert(ANNOTATION_CURRENT_PRIMARY.to_string(), primary.to_string());
    annotations.insert(ANNOTATION_UPGRADE_FROM.to_string(), from_version);
    annotations.insert(
        ANNOTATION_UPGRADE_TO.to_string(),
        config.operator_version.clone(),
    );

    // Only identity and user metadata survive; server-populated fields are dropped
    PgCluster {
        metadata: ObjectMeta {
            name: Some(cluster.name_any()),
            namespace: cluster.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Scale down and remove every replica record, returning how many were removed
async fn remove_replicas(
    ctx: &Context,
    namespace: &str,
    cluster_name: &str,
    primary: &str,
    cleanup: &mut CleanupLog,
) -> usize {
    let replicas = cleanup
        .run(
            "list replicas",
            ctx.store
                .list_replicas(namespace, &Selector::cluster(cluster_name)),
        )
        .await
        .unwrap_or_default();

    let mut removed = 0;
    for replica in &replicas {
        let name = if replica.spec.name.is_empty() {
            replica.name_any()
        } else {
            replica.spec.name.clone()
        };
        cleanup
            .run(
                &format!("scale down {}", name),
                ctx.store.scale_deployment(namespace, &name, 0),
            )
            .await;
        cleanup
            .run(
                &format!("delete replica record {}", name),
                ctx.store.delete_replica(namespace, &replica.name_any()),
            )
            .await;
        if data_volume_name(&name) != data_volume_name(primary) {
            cleanup
                .run(
                    &format!("delete volume of {}", name),
                    ctx.store.delete_pvc(namespace, &data_volume_name(&name)),
                )
                .await;
        } else {
            info!(replica = %name, "replica volume is the primary's; keeping it");
        }
        removed += 1;
    }
    removed
}

/// Create the PGHA record unless it exists
///
/// An existing record is left as it is, which carries its init flag into the
/// new cluster.
async fn ensure_pgha_config(ctx: &Context, namespace: &str, cluster_name: &str) -> Result<()> {
    let name = pgha_config_map_name(cluster_name);
    if ctx.store.get_configmap(namespace, &name).await?.is_some() {
        info!(config_map = %name, "reusing PGHA configuration");
        return Ok(());
    }
    ctx.store
        .create_configmap(
            namespace,
            &generate_pgha_config_map(cluster_name, namespace, "false"),
        )
        .await
}

/// Delete the old cluster's instances, record, jobs, tasks and Patroni records
async fn teardown(
    ctx: &Context,
    namespace: &str,
    cluster_name: &str,
    primary: &str,
    cleanup: &mut CleanupLog,
) {
    let wait = &ctx.config.wait;
    let selector = Selector::cluster(cluster_name);

    let deployments = cleanup
        .run("list deployments", ctx.store.list_deployments(namespace, &selector))
        .await
        .unwrap_or_default();
    for deployment in &deployments {
        let name = deployment.name_any();
        cleanup
            .run(
                &format!("delete deployment {}", name),
                ctx.store.delete_deployment(namespace, &name),
            )
            .await;
    }

    for name in [backrest_repo_name(cluster_name), primary.to_string()] {
        cleanup
            .run(
                &format!("wait for {} removal", name),
                wait_deployment_deleted(
                    ctx.store.as_ref(),
                    namespace,
                    &name,
                    wait.period(),
                    wait.delete_timeout(),
                ),
            )
            .await;
    }

    // Nothing recreates the cluster if the process dies between here and resubmission
    warn!(cluster = %cluster_name, "deleting cluster record ahead of resubmission");
    cleanup
        .run(
            "delete cluster record",
            ctx.store.delete_cluster(namespace, cluster_name),
        )
        .await;
    cleanup
        .run("delete jobs", ctx.store.delete_jobs(namespace, &selector))
        .await;

    let tasks = cleanup
        .run("list tasks", ctx.store.list_tasks(namespace, &selector))
        .await
        .unwrap_or_default();
    for task in tasks
        .iter()
        .filter(|t| t.spec.task_type != TaskType::Upgrade)
    {
        let name = task.name_any();
        cleanup
            .run(
                &format!("delete task {}", name),
                ctx.store.delete_task(namespace, &name),
            )
            .await;
    }

    cleanup
        .run(
            "delete leader record",
            ctx.store
                .delete_configmap(namespace, &leader_config_map_name(cluster_name)),
        )
        .await;
    cleanup
        .run(
            "delete default configuration",
            ctx.store
                .delete_configmap(namespace, &dcs_config_map_name(cluster_name)),
        )
        .await;
}

/// Rewrite the repository secret in the current layout
///
/// The secret is overwritten in place, so a failed write leaves the old
/// credentials untouched.
async fn regenerate_repo_secret(ctx: &Context, namespace: &str, cluster_name: &str) -> Result<()> {
    let name = backrest_repo_secret_name(cluster_name);
    let Some(existing) = ctx.store.get_secret(namespace, &name).await? else {
        warn!(secret = %name, "repository secret not found; nothing to migrate");
        return Ok(());
    };
    let mut migrated = migrate_repo_secret(&existing, cluster_name, namespace, &ctx.config);
    migrated.metadata.resource_version = existing.metadata.resource_version.clone();
    ctx.store.replace_secret(namespace, &migrated).await
}

fn task_cluster_name(task: &PgTask) -> Result<String> {
    task.param(params::CLUSTER)
        .or_else(|| ResourceMeta::of(&task.metadata).cluster())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or(Error::MissingParameter(params::CLUSTER))
}

/// Migrate the cluster named by an upgrade task
///
/// A failure publishes an upgrade-failure event and marks the task failed, so
/// redelivery does not start the migration again.
#[instrument(skip(ctx, task), fields(task = %task.name_any()))]
pub async fn run_upgrade(ctx: &Context, task: &PgTask) -> Result<()> {
    let namespace = task.namespace().unwrap_or_default();
    let task = ctx
        .store
        .get_task(&namespace, &task.name_any())
        .await?
        .unwrap_or_else(|| task.clone());
    if task.is_completed() {
        info!("upgrade already completed; skipping");
        return Ok(());
    }
    if task.is_failed() {
        info!("upgrade failed on an earlier run; skipping");
        return Ok(());
    }

    let result = execute_upgrade(ctx, &task).await;
    if let Err(e) = &result {
        warn!(error = %e, "upgrade failed");
        publish(
            ctx.events.as_ref(),
            OrchestrationEvent::new(
                EventKind::UpgradeFailed,
                &namespace,
                task_cluster_name(&task).unwrap_or_default(),
                format!("upgrade failed: {}", e),
            ),
        )
        .await;
        if let Err(mark_err) = mark_task_failed(ctx.store.as_ref(), &task, &e.to_string()).await {
            warn!(error = %mark_err, "failed to record upgrade failure");
        }
    }
    result
}

async fn execute_upgrade(ctx: &Context, task: &PgTask) -> Result<()> {
    let namespace = task.namespace().unwrap_or_default();
    let cluster_name = task_cluster_name(task)?;
    mark_task_in_progress(ctx.store.as_ref(), task).await?;

    let cluster = ctx
        .store
        .get_cluster(&namespace, &cluster_name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("cluster {}", cluster_name)))?;

    let primary = resolve_primary(ctx.store.as_ref(), &cluster).await;
    info!(cluster = %cluster_name, %primary, "upgrading cluster");

    let mut cleanup = CleanupLog::new(format!("upgrade {}", cluster_name));
    let replicas = remove_replicas(ctx, &namespace, &cluster_name, &primary, &mut cleanup).await;
    cleanup
        .run(
            "PGHA configuration",
            ensure_pgha_config(ctx, &namespace, &cluster_name),
        )
        .await;
    teardown(ctx, &namespace, &cluster_name, &primary, &mut cleanup).await;
    cleanup
        .run(
            "regenerate repository secret",
            regenerate_repo_secret(ctx, &namespace, &cluster_name),
        )
        .await;

    let mut upgraded = upgraded_cluster(
        &cluster,
        &primary,
        replicas,
        task.param(params::CCP_IMAGE_TAG),
        &ctx.config,
    );

    let owner = ResourceMeta::of(&cluster.metadata)
        .owner()
        .or(task.param(params::OWNER))
        .unwrap_or_default()
        .to_string();
    let workflow_id = cleanup
        .run(
            "create workflow",
            create_workflow_task(
                ctx.store.as_ref(),
                &namespace,
                &cluster_name,
                RECREATE_WORKFLOW,
                &owner,
            ),
        )
        .await;
    if let Some(id) = &workflow_id {
        upgraded
            .labels_mut()
            .insert(LABEL_WORKFLOW_ID.to_string(), id.clone());
    }
    upgraded
        .labels_mut()
        .insert(LABEL_PG_CLUSTER.to_string(), cluster_name.clone());

    cleanup.finish();

    ctx.store.create_cluster(&namespace, &upgraded).await?;
    info!(cluster = %cluster_name, replicas, "upgraded cluster submitted");

    mark_task_completed(ctx.store.as_ref(), task, steps::UPGRADE_COMPLETED).await?;

    let progress = [
        (workflow_id.as_deref(), steps::CLUSTER_SUBMITTED),
        (task.param(params::WORKFLOW_ID), steps::UPGRADE_COMPLETED),
    ];
    for (id, step) in progress {
        let Some(id) = id else { continue };
        if let Err(e) = update_workflow(ctx.store.as_ref(), &namespace, id, step).await {
            warn!(workflow = %id, error = %e, "failed to record workflow progress");
        }
    }

    publish(
        ctx.events.as_ref(),
        OrchestrationEvent::new(
            EventKind::UpgradeCompleted,
            &namespace,
            &cluster_name,
            format!(
                "Cluster {} upgraded to {}",
                cluster_name, ctx.config.operator_version
            ),
        ),
    )
    .await;
    Ok(())
}
