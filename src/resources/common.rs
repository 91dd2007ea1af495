//! Label keys, annotation keys and typed access to resource metadata
//!
//! Roles, ownership and workflow membership are encoded as free-form labels on
//! every object the operator touches. [`ResourceMeta`] gives orchestration code
//! named accessors over that map, and [`Selector`] builds the equality selectors
//! used to list objects belonging to a cluster.

use std::collections::BTreeMap;
use std::fmt;

/// Operator field manager name for patches
pub const FIELD_MANAGER: &str = "postgres-ha-operator";

pub const LABEL_PG_CLUSTER: &str = "pg-cluster";
pub const LABEL_PG_DATABASE: &str = "pg-database";
pub const LABEL_DEPLOYMENT_NAME: &str = "deployment-name";
pub const LABEL_SERVICE_NAME: &str = "service-name";
pub const LABEL_BACKREST_REPO: &str = "pgo-backrest-repo";
pub const LABEL_PGBOUNCER: &str = "crunchy-pgbouncer";
pub const LABEL_WORKFLOW_ID: &str = "workflowid";
pub const LABEL_OWNER: &str = "pgouser";
pub const LABEL_PGO_VERSION: &str = "pgo-version";
pub const LABEL_AUTOFAIL: &str = "autofail";
pub const LABEL_PGHA_SCOPE: &str = "crunchy-pgha-scope";
pub const LABEL_EXPORTER: &str = "crunchy-postgres-exporter";
pub const LABEL_CLONE_STEP: &str = "pgo-clone-step";
pub const LABEL_BACKREST_STORAGE_TYPE: &str = "backrest-storage-type";

/// Role label written by Patroni onto live database pods
pub const LABEL_ROLE: &str = "role";
pub const ROLE_PRIMARY: &str = "master";
pub const ROLE_REPLICA: &str = "replica";

/// Labels carried by records created by older operator versions
pub const LEGACY_LABEL_CURRENT_PRIMARY: &str = "current-primary";
pub const LEGACY_LABEL_COLLECT: &str = "crunchy_collect";

/// Labels removed from cluster records during an upgrade
pub const OBSOLETE_LABELS: &[&str] = &[
    "pgo-backrest",
    "primary",
    "archive",
    "archive-timeout",
    LEGACY_LABEL_CURRENT_PRIMARY,
];

pub const ANNOTATION_CURRENT_PRIMARY: &str = "current-primary";
pub const ANNOTATION_UPGRADE_FROM: &str = "upgrade-from";
pub const ANNOTATION_UPGRADE_TO: &str = "upgrade-to";
pub const ANNOTATION_CLONE_SOURCE: &str = "clone-source";
pub const ANNOTATION_CLONE_TARGET: &str = "clone-target";
pub const ANNOTATION_RESTARTED_AT: &str = "restarted-at";

/// Role of an instance as derived from its labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceRole {
    Primary,
    Replica,
    Repository,
    Proxy,
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Primary => write!(f, "primary"),
            InstanceRole::Replica => write!(f, "replica"),
            InstanceRole::Repository => write!(f, "repository"),
            InstanceRole::Proxy => write!(f, "proxy"),
        }
    }
}

/// Typed view over a resource's label map
#[derive(Debug, Clone, Copy)]
pub struct ResourceMeta<'a> {
    labels: Option<&'a BTreeMap<String, String>>,
}

impl<'a> ResourceMeta<'a> {
    pub fn new(labels: Option<&'a BTreeMap<String, String>>) -> Self {
        Self { labels }
    }

    pub fn of(meta: &'a k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Self {
        Self::new(meta.labels.as_ref())
    }

    /// Raw label lookup, ignoring empty values
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.labels
            .and_then(|l| l.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn is_true(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn cluster(&self) -> Option<&'a str> {
        self.get(LABEL_PG_CLUSTER)
    }

    pub fn workflow_id(&self) -> Option<&'a str> {
        self.get(LABEL_WORKFLOW_ID)
    }

    pub fn owner(&self) -> Option<&'a str> {
        self.get(LABEL_OWNER)
    }

    pub fn deployment_name(&self) -> Option<&'a str> {
        self.get(LABEL_DEPLOYMENT_NAME)
    }

    pub fn service_name(&self) -> Option<&'a str> {
        self.get(LABEL_SERVICE_NAME)
    }

    /// Role of a deployment within `cluster_name`, judged from its labels
    ///
    /// Returns `None` for objects that belong to the cluster but do not run
    /// one of the known roles (e.g. one-shot helpers).
    pub fn role(&self, cluster_name: &str) -> Option<InstanceRole> {
        if self.is_true(LABEL_PGBOUNCER) {
            return Some(InstanceRole::Proxy);
        }
        if self.is_true(LABEL_BACKREST_REPO) {
            return Some(InstanceRole::Repository);
        }
        match self.service_name() {
            Some(s) if s == cluster_name => Some(InstanceRole::Primary),
            Some(s) if s == replica_service_name(cluster_name) => Some(InstanceRole::Replica),
            _ => None,
        }
    }
}

/// Service-selector value routing traffic to the primary
pub fn primary_service_name(cluster_name: &str) -> String {
    cluster_name.to_string()
}

/// Service-selector value routing traffic to replicas
pub fn replica_service_name(cluster_name: &str) -> String {
    format!("{}-replica", cluster_name)
}

/// Equality label selector with an optional pod phase filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    labels: BTreeMap<String, String>,
    phase: Option<String>,
}

impl Selector {
    /// All objects labelled as belonging to `cluster_name`
    pub fn cluster(cluster_name: &str) -> Self {
        Self::default().with(LABEL_PG_CLUSTER, cluster_name)
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Only pods in the Running phase
    pub fn running(mut self) -> Self {
        self.phase = Some("Running".to_string());
        self
    }

    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    pub fn label_terms(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Field selector string for the phase filter
    pub fn field_selector(&self) -> Option<String> {
        self.phase.as_ref().map(|p| format!("status.phase={}", p))
    }

    /// Whether a label map satisfies every term
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        f.write_str(&terms.join(","))
    }
}
