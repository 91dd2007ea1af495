//! Resolution of a cluster's current primary from evidence of varying age
//!
//! Clusters created by older operator versions record their primary in
//! different places. Each resolver looks at one source and the first non-empty
//! answer wins; the cluster name is the final fallback because the first
//! instance of a cluster is named after it.

use kube::ResourceExt;
use tracing::{debug, warn};

use crate::controller::classify::live_primary_selector;
use crate::crd::PgCluster;
use crate::resources::ClusterStore;
use crate::resources::common::{
    ANNOTATION_CURRENT_PRIMARY, LEGACY_LABEL_CURRENT_PRIMARY, ResourceMeta,
};

/// Everything known about where the primary might be
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryEvidence {
    /// `deployment-name` of the running pod Patroni labels as leader
    pub live_pod_deployment: Option<String>,
    /// `current-primary` annotation on the cluster record
    pub annotation: Option<String>,
    /// `current-primary` label written by older releases
    pub legacy_label: Option<String>,
}

impl PrimaryEvidence {
    /// Evidence carried by the cluster record itself
    pub fn from_cluster(cluster: &PgCluster) -> Self {
        let non_empty = |v: Option<&String>| v.filter(|s| !s.is_empty()).cloned();
        Self {
            live_pod_deployment: None,
            annotation: non_empty(cluster.annotations().get(ANNOTATION_CURRENT_PRIMARY)),
            legacy_label: non_empty(cluster.labels().get(LEGACY_LABEL_CURRENT_PRIMARY)),
        }
    }
}

pub type Resolver = fn(&PrimaryEvidence) -> Option<&str>;

fn from_live_pod(e: &PrimaryEvidence) -> Option<&str> {
    e.live_pod_deployment.as_deref()
}

fn from_annotation(e: &PrimaryEvidence) -> Option<&str> {
    e.annotation.as_deref()
}

fn from_legacy_label(e: &PrimaryEvidence) -> Option<&str> {
    e.legacy_label.as_deref()
}

/// Resolvers in decreasing order of trust
pub const RESOLVERS: &[(&str, Resolver)] = &[
    ("live pod label", from_live_pod),
    ("cluster annotation", from_annotation),
    ("legacy label", from_legacy_label),
];

/// First non-empty answer of `resolvers`, or `fallback`
pub fn first_non_empty(
    evidence: &PrimaryEvidence,
    resolvers: &[(&str, Resolver)],
    fallback: &str,
) -> String {
    resolvers
        .iter()
        .find_map(|(source, resolve)| {
            resolve(evidence)
                .filter(|v| !v.is_empty())
                .map(|v| {
                    debug!(source, primary = v, "resolved primary");
                    v.to_string()
                })
        })
        .unwrap_or_else(|| fallback.to_string())
}

/// Resolve the primary of `cluster`, consulting the live pods first
///
/// A failure to list pods only removes the live evidence; older sources still apply.
pub async fn resolve_primary(store: &dyn ClusterStore, cluster: &PgCluster) -> String {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let mut evidence = PrimaryEvidence::from_cluster(cluster);

    match store
        .list_pods(&namespace, &live_primary_selector(&cluster_name))
        .await
    {
        Ok(pods) => {
            evidence.live_pod_deployment = pods
                .iter()
                .find_map(|p| ResourceMeta::of(&p.metadata).deployment_name())
                .map(str::to_string);
        }
        Err(e) => warn!(cluster = %cluster_name, error = %e, "could not list primary pods"),
    }

    first_non_empty(&evidence, RESOLVERS, &cluster_name)
}
