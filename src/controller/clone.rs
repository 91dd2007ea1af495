//! Three-step clone of a cluster from another cluster's backup repository
//!
//! Step 1 validates the request, provisions the target volumes and starts copying
//! the source repository. Step 2 serves the copied repository from a temporary
//! host and starts a delta restore into the target data volume. Step 3 removes
//! the temporary host and submits the new cluster record.
//!
//! Each step is its own task and may be delivered more than once. Objects are
//! created only when absent, and a completed task is never run again.

use std::collections::BTreeMap;

use kube::ResourceExt;
use kube::core::ObjectMeta;
use tracing::{info, instrument, warn};

use crate::controller::classify::live_primary_selector;
use crate::controller::cleanup::CleanupLog;
use crate::controller::status::{mark_task_completed, mark_task_failed, mark_task_in_progress};
use crate::controller::wait::{wait_deleted, wait_ready};
use crate::controller::workflow::{steps, update_workflow};
use crate::controller::{Context, Error, Result};
use crate::crd::{BackrestStorageType, PgCluster, PgClusterSpec, PgTask, StorageSpec, TaskType, params};
use crate::resources::backrest::{
    RestoreOptions, backrest_repo_name, backrest_repo_secret_name, generate_repo_deployment,
    generate_repo_service, generate_repo_sync_job, generate_restore_job, wal_link,
};
use crate::resources::common::{
    ANNOTATION_CURRENT_PRIMARY, LABEL_EXPORTER, LABEL_OWNER, LABEL_PG_CLUSTER, LABEL_WORKFLOW_ID,
};
use crate::resources::events::{EventKind, OrchestrationEvent, publish};
use crate::resources::patroni::{
    DATABASE_CONTAINER, parse_major_version, version_command, wal_dir_for_major,
};
use crate::resources::pvc::{
    backrest_repo_volume_name, data_volume_name, generate_pvc, tablespace_volume_name,
    wal_volume_name, with_size_override,
};
use crate::resources::secret::{ClusterSecretNames, copy_repo_secret};

/// Names and options shared by every clone step
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub namespace: String,
    pub source: String,
    pub target: String,
    pub workflow_id: Option<String>,
    pub storage_type: BackrestStorageType,
    pub pvc_size: Option<String>,
    pub backrest_pvc_size: Option<String>,
    pub enable_metrics: bool,
    pub owner: Option<String>,
}

impl CloneRequest {
    pub fn from_task(task: &PgTask) -> Result<Self> {
        let requested = task.param(params::BACKREST_STORAGE_TYPE).unwrap_or("local");
        let storage_type = BackrestStorageType::parse(requested).ok_or_else(|| {
            Error::ValidationError(format!("unknown backup storage type {}", requested))
        })?;
        Ok(Self {
            namespace: task.namespace().unwrap_or_default(),
            source: task
                .param(params::SOURCE_CLUSTER)
                .ok_or(Error::MissingParameter(params::SOURCE_CLUSTER))?
                .to_string(),
            target: task
                .param(params::TARGET_CLUSTER)
                .ok_or(Error::MissingParameter(params::TARGET_CLUSTER))?
                .to_string(),
            workflow_id: task.param(params::WORKFLOW_ID).map(str::to_string),
            storage_type,
            pvc_size: task.param(params::PVC_SIZE).map(str::to_string),
            backrest_pvc_size: task.param(params::BACKREST_PVC_SIZE).map(str::to_string),
            enable_metrics: task.param(params::ENABLE_METRICS) == Some("true"),
            owner: task.param(params::OWNER).map(str::to_string),
        })
    }
}

/// Run the clone step carried by `task`
///
/// A failure publishes a clone-failure event with the error text and marks
/// the task failed without completing it. Later runs of a failed task do
/// nothing. The error is also returned so the caller can count it.
#[instrument(skip(ctx, task), fields(task = %task.name_any()))]
pub async fn run_clone_step(ctx: &Context, task: &PgTask) -> Result<()> {
    let namespace = task.namespace().unwrap_or_default();

    // Redelivered events can carry a stale status; the stored record decides
    let task = ctx
        .store
        .get_task(&namespace, &task.name_any())
        .await?
        .unwrap_or_else(|| task.clone());
    if task.is_completed() {
        info!("clone step already completed; skipping");
        return Ok(());
    }
    if task.is_failed() {
        info!("clone step failed on an earlier run; skipping");
        return Ok(());
    }

    let result = execute_step(ctx, &task).await;
    if let Err(e) = &result {
        let cluster = task
            .param(params::TARGET_CLUSTER)
            .unwrap_or_default()
            .to_string();
        warn!(error = %e, "clone step failed");
        publish(
            ctx.events.as_ref(),
            OrchestrationEvent::new(
                EventKind::CloneFailed,
                &namespace,
                cluster,
                format!("{} failed: {}", task.spec.task_type, e),
            ),
        )
        .await;
        if let Err(mark_err) = mark_task_failed(ctx.store.as_ref(), &task, &e.to_string()).await {
            warn!(error = %mark_err, "failed to record clone step failure");
        }
    }
    result
}

async fn execute_step(ctx: &Context, task: &PgTask) -> Result<()> {
    let request = CloneRequest::from_task(task)?;
    mark_task_in_progress(ctx.store.as_ref(), task).await?;

    let step_key = match task.spec.task_type {
        TaskType::CloneStep1 => {
            clone_step1(ctx, &request).await?;
            steps::CLONE_STEP1_COMPLETED
        }
        TaskType::CloneStep2 => {
            clone_step2(ctx, &request).await?;
            steps::CLONE_STEP2_COMPLETED
        }
        TaskType::CloneStep3 => {
            clone_step3(ctx, &request).await?;
            steps::CLONE_STEP3_COMPLETED
        }
        other => {
            return Err(Error::InvalidTask(format!("{} is not a clone step", other)));
        }
    };

    mark_task_completed(ctx.store.as_ref(), task, step_key).await?;

    if let Some(id) = &request.workflow_id {
        if let Err(e) = update_workflow(ctx.store.as_ref(), &request.namespace, id, step_key).await {
            warn!(workflow = %id, error = %e, "failed to record workflow progress");
        }
    }

    publish(
        ctx.events.as_ref(),
        OrchestrationEvent::new(
            EventKind::CloneStepCompleted,
            &request.namespace,
            &request.target,
            format!("Clone of {} into {}: {}", request.source, request.target, step_key),
        ),
    )
    .await;
    Ok(())
}

async fn get_source(ctx: &Context, request: &CloneRequest) -> Result<PgCluster> {
    ctx.store
        .get_cluster(&request.namespace, &request.source)
        .await?
        .ok_or_else(|| Error::NotFound(format!("source cluster {}", request.source)))
}

/// Tolerate "already exists" from a create call
fn created_or_present(result: Result<()>, what: &str) -> Result<()> {
    match result {
        Err(e) if e.is_conflict() => {
            info!(object = what, "already exists");
            Ok(())
        }
        other => other,
    }
}

/// Volumes the target needs, each with the storage spec to create it from
pub fn target_volumes(source: &PgCluster, request: &CloneRequest) -> Vec<(String, StorageSpec)> {
    let spec = &source.spec;
    let target = &request.target;
    let mut volumes = vec![
        (
            backrest_repo_volume_name(target),
            with_size_override(&spec.backrest_storage, request.backrest_pvc_size.as_deref()),
        ),
        (
            data_volume_name(target),
            with_size_override(&spec.primary_storage, request.pvc_size.as_deref()),
        ),
    ];
    if spec.wal_storage.is_persistent() {
        volumes.push((wal_volume_name(target), spec.wal_storage.clone()));
    }
    for (tablespace, storage) in &spec.tablespace_mounts {
        volumes.push((tablespace_volume_name(target, tablespace), storage.clone()));
    }
    volumes
}

async fn ensure_volumes(ctx: &Context, source: &PgCluster, request: &CloneRequest) -> Result<()> {
    for (name, storage) in target_volumes(source, request) {
        if ctx.store.get_pvc(&request.namespace, &name).await?.is_some() {
            info!(volume = %name, "volume already present");
            continue;
        }
        let pvc = generate_pvc(&name, &request.target, &request.namespace, &storage);
        created_or_present(ctx.store.create_pvc(&request.namespace, &pvc).await, &name)?;
        info!(volume = %name, size = %storage.size, "volume created");
    }
    Ok(())
}

/// Validate, provision the target volumes and start copying the source repository
async fn clone_step1(ctx: &Context, request: &CloneRequest) -> Result<()> {
    let source = get_source(ctx, request).await?;

    let available = source.spec.storage_types();
    if !available.contains(&request.storage_type) {
        return Err(Error::StorageTypeMismatch {
            cluster: request.source.clone(),
            requested: request.storage_type.to_string(),
            available: available
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(","),
        });
    }

    if ctx
        .store
        .get_cluster(&request.namespace, &request.target)
        .await?
        .is_some()
    {
        return Err(Error::ClusterExists(request.target.clone()));
    }

    ensure_volumes(ctx, &source, request).await?;

    let job = generate_repo_sync_job(&source, &request.target, &request.namespace, &ctx.config);
    created_or_present(
        ctx.store.create_job(&request.namespace, &job).await,
        "repository sync job",
    )?;
    Ok(())
}

/// Major PostgreSQL version running in the source primary
async fn source_major_version(ctx: &Context, request: &CloneRequest) -> Result<u32> {
    let pods = ctx
        .store
        .list_pods(&request.namespace, &live_primary_selector(&request.source))
        .await?;
    let pod = pods
        .first()
        .map(|p| p.name_any())
        .ok_or_else(|| Error::NotFound(format!("running primary of {}", request.source)))?;
    let output = ctx
        .executor
        .exec(&request.namespace, &pod, DATABASE_CONTAINER, &version_command(), None)
        .await?;
    parse_major_version(&output.stdout).ok_or_else(|| Error::ExecFailed {
        pod,
        message: format!("unrecognized version output: {}", output.stdout.trim()),
    })
}

/// Serve the copied repository and start the delta restore
async fn clone_step2(ctx: &Context, request: &CloneRequest) -> Result<()> {
    let source = get_source(ctx, request).await?;
    let namespace = &request.namespace;
    let target = &request.target;
    let wait = &ctx.config.wait;

    ensure_volumes(ctx, &source, request).await?;

    let secret_name = backrest_repo_secret_name(&request.source);
    let secret = ctx
        .store
        .get_secret(namespace, &secret_name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("secret {}", secret_name)))?;
    created_or_present(
        ctx.store
            .create_secret(namespace, &copy_repo_secret(&secret, target, namespace))
            .await,
        "repository secret",
    )?;

    let deployment =
        generate_repo_deployment(&source, target, namespace, request.storage_type, &ctx.config);
    created_or_present(
        ctx.store.create_deployment(namespace, &deployment).await,
        "repository deployment",
    )?;
    created_or_present(
        ctx.store
            .create_service(namespace, &generate_repo_service(target, namespace))
            .await,
        "repository service",
    )?;

    let repo = backrest_repo_name(target);
    if let Err(e) = wait_ready(
        ctx.store.as_ref(),
        namespace,
        &repo,
        wait.period(),
        wait.ready_timeout(),
    )
    .await
    {
        warn!(deployment = %repo, error = %e, "repository host not ready; continuing");
    }

    let wal_link = if source.spec.wal_storage.is_persistent() {
        let major = source_major_version(ctx, request).await?;
        Some(wal_link(wal_dir_for_major(major), target))
    } else {
        None
    };

    let options = RestoreOptions {
        repo_type: request.storage_type,
        verify_tls: source.spec.backrest_s3_verify_tls != "false",
        wal_link,
    };
    let job = generate_restore_job(&source, target, namespace, &options, &ctx.config);
    created_or_present(ctx.store.create_job(namespace, &job).await, "restore job")?;
    Ok(())
}

/// Spec of the new cluster, copied from the source with clone-specific overrides
pub fn build_clone_cluster(source: &PgCluster, request: &CloneRequest) -> PgCluster {
    let target = &request.target;
    let mut spec: PgClusterSpec = source.spec.clone();

    spec.cluster_name = target.clone();
    spec.replicas = "0".to_string();
    spec.pgbouncer.replicas = 0;
    spec.shutdown = false;
    spec.standby = false;

    let secrets = ClusterSecretNames::for_cluster(target, &spec.user);
    spec.primary_secret_name = secrets.primary;
    spec.root_secret_name = secrets.root;
    spec.user_secret_name = secrets.user;

    if let Some(size) = &request.pvc_size {
        spec.primary_storage.size = size.clone();
        spec.replica_storage.size = size.clone();
    }
    if let Some(size) = &request.backrest_pvc_size {
        spec.backrest_storage.size = size.clone();
    }
    if request.enable_metrics {
        spec.exporter = true;
    }

    let mut labels = BTreeMap::from([(LABEL_PG_CLUSTER.to_string(), target.clone())]);
    if let Some(id) = &request.workflow_id {
        labels.insert(LABEL_WORKFLOW_ID.to_string(), id.clone());
    }
    if let Some(owner) = &request.owner {
        labels.insert(LABEL_OWNER.to_string(), owner.clone());
    }
    if spec.exporter {
        labels.insert(LABEL_EXPORTER.to_string(), "true".to_string());
    }

    PgCluster {
        metadata: ObjectMeta {
            name: Some(target.clone()),
            namespace: Some(request.namespace.clone()),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_CURRENT_PRIMARY.to_string(),
                target.clone(),
            )])),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Remove the temporary repository host and submit the new cluster
async fn clone_step3(ctx: &Context, request: &CloneRequest) -> Result<()> {
    let source = get_source(ctx, request).await?;
    let namespace = &request.namespace;
    let repo = backrest_repo_name(&request.target);
    let wait = &ctx.config.wait;

    let mut cleanup = CleanupLog::new(format!("clone {}", request.target));
    cleanup
        .run("delete repository deployment", ctx.store.delete_deployment(namespace, &repo))
        .await;
    cleanup
        .run("delete repository service", ctx.store.delete_service(namespace, &repo))
        .await;
    cleanup
        .run(
            "wait for repository removal",
            wait_deleted(
                ctx.store.as_ref(),
                namespace,
                &repo,
                wait.period(),
                wait.delete_timeout(),
            ),
        )
        .await;
    cleanup.finish();

    // Step 1 refused an existing target, so a present one is this step's own
    let cluster = build_clone_cluster(&source, request);
    created_or_present(
        ctx.store.create_cluster(namespace, &cluster).await.map(|_| ()),
        "cloned cluster",
    )?;
    info!(cluster = %request.target, "cloned cluster submitted");
    Ok(())
}
