//! Persistent volume naming and claim generation
//!
//! Volume names are derived from the cluster/instance name and the volume's role
//! so that any orchestration step can recompute the name without a lookup.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ObjectMeta;

use crate::crd::{PgCluster, StorageSpec};
use crate::resources::common::LABEL_PG_CLUSTER;

const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

/// What a volume is used for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeRole {
    /// Data directory of the primary instance
    Primary,
    /// Data directory of a replica instance
    Replica,
    /// Dedicated WAL volume of an instance
    Wal,
    /// Backup repository of the cluster
    BackrestRepo,
    /// Tablespace volume of an instance
    Tablespace(String),
}

/// Data volume name for an instance
pub fn data_volume_name(instance: &str) -> String {
    instance.to_string()
}

pub fn wal_volume_name(instance: &str) -> String {
    format!("{}-wal", instance)
}

pub fn backrest_repo_volume_name(cluster_name: &str) -> String {
    format!("{}-pgbr-repo", cluster_name)
}

pub fn tablespace_volume_name(instance: &str, tablespace: &str) -> String {
    format!("{}-tablespace-{}", instance, tablespace)
}

/// Work out the role of an existing volume from its name alone
///
/// `primary` is the instance name currently holding the primary role.
pub fn classify_volume(name: &str, cluster_name: &str, primary: &str) -> VolumeRole {
    if name == backrest_repo_volume_name(cluster_name) {
        return VolumeRole::BackrestRepo;
    }
    if name == data_volume_name(primary) {
        return VolumeRole::Primary;
    }
    if name.ends_with("-wal") {
        return VolumeRole::Wal;
    }
    if let Some((_, tablespace)) = name.split_once("-tablespace-") {
        return VolumeRole::Tablespace(tablespace.to_string());
    }
    VolumeRole::Replica
}

/// Storage settings the cluster declares for a volume role
pub fn storage_for_role<'a>(cluster: &'a PgCluster, role: &VolumeRole) -> Option<&'a StorageSpec> {
    let spec = &cluster.spec;
    match role {
        VolumeRole::Primary => Some(&spec.primary_storage),
        VolumeRole::Replica => Some(&spec.replica_storage),
        VolumeRole::Wal => Some(&spec.wal_storage),
        VolumeRole::BackrestRepo => Some(&spec.backrest_storage),
        VolumeRole::Tablespace(name) => spec.tablespace_mounts.get(name),
    }
}

/// Generate a persistent volume claim for `name` from a storage spec
pub fn generate_pvc(
    name: &str,
    cluster_name: &str,
    namespace: &str,
    storage: &StorageSpec,
) -> PersistentVolumeClaim {
    let access_mode = if storage.access_mode.is_empty() {
        DEFAULT_ACCESS_MODE.to_string()
    } else {
        storage.access_mode.clone()
    };

    let selector = parse_match_labels(&storage.match_labels).map(|labels| LabelSelector {
        match_labels: Some(labels),
        ..Default::default()
    });

    let mut annotations = BTreeMap::new();
    if !storage.supplemental_groups.is_empty() {
        annotations.insert(
            "pv.beta.kubernetes.io/gid".to_string(),
            storage.supplemental_groups.clone(),
        );
    }

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_PG_CLUSTER.to_string(),
                cluster_name.to_string(),
            )])),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode]),
            storage_class_name: (storage.storage_type == "dynamic"
                && !storage.storage_class.is_empty())
            .then(|| storage.storage_class.clone()),
            selector,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Parse "key=value" match labels; anything else is ignored
fn parse_match_labels(raw: &str) -> Option<BTreeMap<String, String>> {
    let (k, v) = raw.split_once('=')?;
    let (k, v) = (k.trim(), v.trim());
    if k.is_empty() || v.is_empty() {
        return None;
    }
    Some(BTreeMap::from([(k.to_string(), v.to_string())]))
}

/// Copy of `storage` with its size replaced when an override is given
pub fn with_size_override(storage: &StorageSpec, size: Option<&str>) -> StorageSpec {
    let mut storage = storage.clone();
    if let Some(size) = size.filter(|s| !s.is_empty()) {
        storage.size = size.to_string();
    }
    storage
}
