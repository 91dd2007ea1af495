use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PgCluster is the Schema for the pgclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "postgres-ha.io",
    version = "v1",
    kind = "PgCluster",
    plural = "pgclusters",
    shortname = "pgc",
    namespaced,
    status = "PgClusterStatus",
    printcolumn = r#"{"name":"Replicas", "type":"string", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterSpec {
    /// Name of the cluster; mirrors `metadata.name`
    pub cluster_name: String,

    /// Container image name for the database (e.g. "crunchy-postgres-ha")
    pub ccp_image: String,

    #[serde(default)]
    pub ccp_image_tag: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ccp_image_prefix: String,

    /// Database port
    #[serde(default = "default_port")]
    pub port: String,

    pub primary_storage: StorageSpec,

    #[serde(default)]
    pub replica_storage: StorageSpec,

    #[serde(default)]
    pub backrest_storage: StorageSpec,

    /// Dedicated WAL volume; empty storage type means WAL lives in the data volume
    #[serde(default)]
    pub wal_storage: StorageSpec,

    /// Tablespace name -> storage
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tablespace_mounts: BTreeMap<String, StorageSpec>,

    /// Desired number of replicas, kept as a string for compatibility with older records
    #[serde(default = "default_replicas")]
    pub replicas: String,

    /// Backup repository storage types; empty means local
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backrest_storage_types: Vec<BackrestStorageType>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_s3_bucket: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_s3_endpoint: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_s3_region: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_s3_uri_style: String,

    /// "true"/"false"; empty means verify
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_s3_verify_tls: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_gcs_bucket: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_gcs_endpoint: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_gcs_key_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_repo_path: String,

    /// Cluster streams from a remote backup repository instead of taking writes
    #[serde(default)]
    pub standby: bool,

    #[serde(default)]
    pub shutdown: bool,

    /// Connection pooler (proxy) settings
    #[serde(default)]
    pub pgbouncer: PgBouncerSpec,

    #[serde(default)]
    pub tls: TlsSpec,

    #[serde(default)]
    pub tls_only: bool,

    /// Run the metrics exporter sidecar
    #[serde(default)]
    pub exporter: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary_secret_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root_secret_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_secret_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_labels: BTreeMap<String, String>,
}

fn default_port() -> String {
    "5432".to_string()
}

fn default_replicas() -> String {
    "0".to_string()
}

impl PgClusterSpec {
    /// Storage types in effect, defaulting to local when none are configured
    pub fn storage_types(&self) -> Vec<BackrestStorageType> {
        if self.backrest_storage_types.is_empty() {
            vec![BackrestStorageType::Local]
        } else {
            self.backrest_storage_types.clone()
        }
    }

    /// The remote object-storage type in use, if any (S3 wins over GCS)
    pub fn remote_storage_type(&self) -> Option<BackrestStorageType> {
        let types = self.storage_types();
        [BackrestStorageType::S3, BackrestStorageType::Gcs]
            .into_iter()
            .find(|t| types.contains(t))
    }

    /// Replica count parsed from the string field; garbage counts as zero
    pub fn replica_count(&self) -> i32 {
        self.replicas.trim().parse().unwrap_or(0)
    }
}

/// Storage configuration for a persistent volume claim
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// "create", "dynamic" or "emptydir"; empty means unset
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_mode: String,

    /// Size of the persistent volume (e.g., "10Gi")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class: String,

    /// Comma separated supplemental group ids
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub supplemental_groups: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub match_labels: String,
}

impl StorageSpec {
    /// Whether this spec asks for a persistent claim at all
    pub fn is_persistent(&self) -> bool {
        matches!(self.storage_type.as_str(), "create" | "dynamic")
    }
}

/// Backup repository storage backend
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackrestStorageType {
    Local,
    S3,
    Gcs,
}

impl BackrestStorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackrestStorageType::Local => "local",
            BackrestStorageType::S3 => "s3",
            BackrestStorageType::Gcs => "gcs",
        }
    }

    /// Parse a storage type name as it appears in task parameters
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "local" | "posix" => Some(BackrestStorageType::Local),
            "s3" => Some(BackrestStorageType::S3),
            "gcs" => Some(BackrestStorageType::Gcs),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackrestStorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection pooler (proxy) configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerSpec {
    /// Number of proxy replicas; zero disables the proxy
    #[serde(default)]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_secret: String,
}

impl PgBouncerSpec {
    pub fn enabled(&self) -> bool {
        self.replicas > 0
    }
}

/// TLS configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_secret: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_secret: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub replication_tls_secret: String,
}

impl TlsSpec {
    pub fn is_enabled(&self) -> bool {
        !self.ca_secret.is_empty() && !self.tls_secret.is_empty()
    }
}

/// Status of the PgCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterStatus {
    #[serde(default)]
    pub state: ClusterState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Cluster lifecycle state
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterState {
    #[default]
    Created,
    Processed,
    Initialized,
    Bootstrapping,
    Bootstrapped,
    Restoring,
    Shutdown,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Created => write!(f, "Created"),
            ClusterState::Processed => write!(f, "Processed"),
            ClusterState::Initialized => write!(f, "Initialized"),
            ClusterState::Bootstrapping => write!(f, "Bootstrapping"),
            ClusterState::Bootstrapped => write!(f, "Bootstrapped"),
            ClusterState::Restoring => write!(f, "Restoring"),
            ClusterState::Shutdown => write!(f, "Shutdown"),
        }
    }
}
