use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PgTask is a possibly multi-step asynchronous unit of work against a cluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "postgres-ha.io",
    version = "v1",
    kind = "PgTask",
    plural = "pgtasks",
    namespaced,
    status = "PgTaskStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.taskType"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgTaskSpec {
    pub name: String,

    pub task_type: TaskType,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Kind of work a task carries
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CloneStep1,
    CloneStep2,
    CloneStep3,
    Upgrade,
    Failover,
    Shutdown,
    Startup,
    EnableStandby,
    DisableStandby,
    Restart,
    /// Progress record for a multi-step workflow; never executed
    #[default]
    Workflow,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CloneStep1 => "clone-step1",
            TaskType::CloneStep2 => "clone-step2",
            TaskType::CloneStep3 => "clone-step3",
            TaskType::Upgrade => "upgrade",
            TaskType::Failover => "failover",
            TaskType::Shutdown => "shutdown",
            TaskType::Startup => "startup",
            TaskType::EnableStandby => "enable-standby",
            TaskType::DisableStandby => "disable-standby",
            TaskType::Restart => "restart",
            TaskType::Workflow => "workflow",
        }
    }

    pub fn is_clone_step(&self) -> bool {
        matches!(
            self,
            TaskType::CloneStep1 | TaskType::CloneStep2 | TaskType::CloneStep3
        )
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task parameter keys
pub mod params {
    pub const SOURCE_CLUSTER: &str = "sourceClusterName";
    pub const TARGET_CLUSTER: &str = "targetClusterName";
    pub const WORKFLOW_ID: &str = "workflowID";
    pub const BACKREST_STORAGE_TYPE: &str = "backrestStorageType";
    pub const BACKREST_PVC_SIZE: &str = "backrestPVCSize";
    pub const PVC_SIZE: &str = "pvcSize";
    pub const ENABLE_METRICS: &str = "enableMetrics";
    pub const CLUSTER: &str = "clusterName";
    pub const FAILOVER_TARGET: &str = "target";
    pub const CCP_IMAGE_TAG: &str = "ccpImageTag";
    pub const OWNER: &str = "pgouser";
    pub const WORKFLOW_TYPE: &str = "workflowType";
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgTaskStatus {
    #[serde(default)]
    pub state: TaskState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Set when a run ended in an error that must not be retried
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

/// Task progress; only ever moves forward
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "Pending"),
            TaskState::InProgress => write!(f, "InProgress"),
            TaskState::Completed => write!(f, "Completed"),
        }
    }
}

impl PgTask {
    /// Current state, treating a missing status as pending
    pub fn state(&self) -> TaskState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.failed)
    }

    /// Look up a non-empty parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.spec
            .parameters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
