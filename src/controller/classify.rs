//! Primary/replica classification of a cluster's database deployments
//!
//! The live `role=master` label Patroni writes onto the running leader pod is the
//! only evidence of primacy used here. Any database deployment without such a
//! pod is a replica, so an uncertain instance gets restarted rather than skipped.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, instrument};

use crate::controller::{Error, Result};
use crate::resources::common::{
    LABEL_PG_DATABASE, LABEL_ROLE, ROLE_PRIMARY, ResourceMeta, Selector,
};
use crate::resources::ClusterStore;

/// Database deployments of one cluster partitioned by live role
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub cluster: String,
    pub primaries: Vec<Deployment>,
    pub replicas: Vec<Deployment>,
}

impl Classification {
    /// The single primary, or [`Error::AmbiguousPrimary`] with how many were seen
    pub fn sole_primary(&self) -> Result<&Deployment> {
        match self.primaries.as_slice() {
            [primary] => Ok(primary),
            others => Err(Error::AmbiguousPrimary {
                cluster: self.cluster.clone(),
                found: others.len(),
            }),
        }
    }

    pub fn primary_names(&self) -> Vec<String> {
        self.primaries.iter().map(|d| d.name_any()).collect()
    }

    pub fn replica_names(&self) -> Vec<String> {
        self.replicas.iter().map(|d| d.name_any()).collect()
    }
}

/// Selector for the running pods Patroni reports as leader
pub fn live_primary_selector(cluster_name: &str) -> Selector {
    Selector::cluster(cluster_name)
        .with(LABEL_ROLE, ROLE_PRIMARY)
        .running()
}

/// Classify every database deployment of `cluster_name`
///
/// A listing failure is returned as is; classification never works on partial data.
#[instrument(skip(store), fields(cluster = %cluster_name))]
pub async fn classify(
    store: &dyn ClusterStore,
    namespace: &str,
    cluster_name: &str,
) -> Result<Classification> {
    let deployments = store
        .list_deployments(
            namespace,
            &Selector::cluster(cluster_name).with(LABEL_PG_DATABASE, "true"),
        )
        .await?;

    let pods = store
        .list_pods(namespace, &live_primary_selector(cluster_name))
        .await?;

    let primary_deployments: BTreeSet<String> = pods
        .iter()
        .filter_map(|pod| ResourceMeta::of(&pod.metadata).deployment_name())
        .map(str::to_string)
        .collect();

    let (primaries, replicas): (Vec<_>, Vec<_>) = deployments
        .into_iter()
        .partition(|d| primary_deployments.contains(&d.name_any()));

    debug!(
        primaries = ?primaries.iter().map(|d| d.name_any()).collect::<Vec<_>>(),
        replicas = replicas.len(),
        "classified deployments"
    );

    Ok(Classification {
        cluster: cluster_name.to_string(),
        primaries,
        replicas,
    })
}
