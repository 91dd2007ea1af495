use k8s_openapi::api::core::v1::{NodeAffinity, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::StorageSpec;

/// PgReplica describes one desired replica instance of a PgCluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "postgres-ha.io",
    version = "v1",
    kind = "PgReplica",
    plural = "pgreplicas",
    namespaced,
    status = "PgReplicaStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgReplicaSpec {
    /// Instance name; also the name of the replica's Deployment and volume
    pub name: String,

    pub cluster_name: String,

    #[serde(default)]
    pub replica_storage: StorageSpec,

    /// Overrides the cluster-level node affinity for this replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,

    /// Overrides the cluster-level tolerations for this replica
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgReplicaStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}
