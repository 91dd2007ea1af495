//! Saga progress records
//!
//! A workflow is a PgTask of type `workflow` that is never executed. Its
//! parameters collect one timestamp per completed step, keyed by the step's
//! status key, so the front-end can show how far a clone or upgrade got.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::controller::{Error, Result};
use crate::crd::{PgTask, PgTaskSpec, TaskType, params};
use crate::resources::ClusterStore;
use crate::resources::common::{LABEL_OWNER, LABEL_PG_CLUSTER, LABEL_WORKFLOW_ID, Selector};

/// Status keys stamped as a workflow progresses
pub mod steps {
    pub const SUBMITTED: &str = "task submitted";
    pub const CLONE_STEP1_COMPLETED: &str = "clone step 1 completed";
    pub const CLONE_STEP2_COMPLETED: &str = "clone step 2 completed";
    pub const CLONE_STEP3_COMPLETED: &str = "clone step 3 completed";
    pub const UPGRADE_COMPLETED: &str = "upgrade completed";
    pub const CLUSTER_SUBMITTED: &str = "cluster submitted";
}

/// A workflow's id and its recorded parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub id: String,
    pub task_name: String,
    pub parameters: BTreeMap<String, String>,
}

impl Workflow {
    /// Timestamp recorded for `step`, if it has happened
    pub fn step(&self, step: &str) -> Option<&str> {
        self.parameters.get(step).map(String::as_str)
    }
}

pub fn workflow_task_name(cluster_name: &str, workflow_type: &str) -> String {
    format!("{}-{}", cluster_name, workflow_type)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Create the progress record for a new workflow and return its id
#[instrument(skip(store))]
pub async fn create_workflow_task(
    store: &dyn ClusterStore,
    namespace: &str,
    cluster_name: &str,
    workflow_type: &str,
    owner: &str,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let name = workflow_task_name(cluster_name, workflow_type);

    let mut labels = BTreeMap::from([
        (LABEL_PG_CLUSTER.to_string(), cluster_name.to_string()),
        (LABEL_WORKFLOW_ID.to_string(), id.clone()),
    ]);
    if !owner.is_empty() {
        labels.insert(LABEL_OWNER.to_string(), owner.to_string());
    }

    let task = PgTask {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: PgTaskSpec {
            name: name.clone(),
            task_type: TaskType::Workflow,
            parameters: BTreeMap::from([
                (params::WORKFLOW_ID.to_string(), id.clone()),
                (params::CLUSTER.to_string(), cluster_name.to_string()),
                (params::WORKFLOW_TYPE.to_string(), workflow_type.to_string()),
                (steps::SUBMITTED.to_string(), now()),
            ]),
        },
        status: None,
    };

    // A leftover record from an earlier run of the same workflow is replaced
    store.delete_task(namespace, &name).await?;
    store.create_task(namespace, &task).await?;
    info!(task = %name, workflow = %id, "workflow created");
    Ok(id)
}

async fn find_workflow_task(store: &dyn ClusterStore, namespace: &str, id: &str) -> Result<PgTask> {
    store
        .list_tasks(namespace, &Selector::default().with(LABEL_WORKFLOW_ID, id))
        .await?
        .into_iter()
        .find(|t| t.spec.task_type == TaskType::Workflow)
        .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))
}

/// Record that `step` of workflow `id` happened now
#[instrument(skip(store))]
pub async fn update_workflow(
    store: &dyn ClusterStore,
    namespace: &str,
    id: &str,
    step: &str,
) -> Result<()> {
    let task = find_workflow_task(store, namespace, id).await?;
    let patch = json!({ "spec": { "parameters": { step: now() } } });
    store.patch_task(namespace, &task.name_any(), &patch).await
}

/// Read workflow `id`
pub async fn get_workflow(store: &dyn ClusterStore, namespace: &str, id: &str) -> Result<Workflow> {
    let task = find_workflow_task(store, namespace, id).await?;
    Ok(Workflow {
        id: id.to_string(),
        task_name: task.name_any(),
        parameters: task.spec.parameters,
    })
}
