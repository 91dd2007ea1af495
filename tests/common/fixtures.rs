//! Builders for cluster records and the objects an instance is made of
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let h = Harness::new();
//! let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 2);
//! ```
//!
//! A seeded cluster has a primary deployment named after the cluster, replica
//! deployments `<cluster>-rpl<i>`, and one running pod `<deployment>-pod` each.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, PodStatus, Secret};
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;

use postgres_ha_operator::crd::{
    BackrestStorageType, ClusterState, PgBouncerSpec, PgCluster, PgClusterSpec, PgClusterStatus,
    PgReplica, PgReplicaSpec, PgTask, PgTaskSpec, StorageSpec, TaskType,
};
use postgres_ha_operator::resources::backrest::backrest_repo_name;
use postgres_ha_operator::resources::common::{
    ANNOTATION_CURRENT_PRIMARY, LABEL_BACKREST_REPO, LABEL_DEPLOYMENT_NAME, LABEL_PG_CLUSTER,
    LABEL_PG_DATABASE, LABEL_PGBOUNCER, LABEL_ROLE, LABEL_SERVICE_NAME, ROLE_PRIMARY,
    ROLE_REPLICA, replica_service_name,
};
use postgres_ha_operator::resources::patroni::{
    DCS_CONFIG_ANNOTATION, dcs_config_map_name, generate_pgha_config_map,
};
use postgres_ha_operator::resources::pvc::generate_pvc;

use super::fake::FakeStore;

pub const NAMESPACE: &str = "pgo";

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn meta(name: &str, pairs: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        labels: Some(labels(pairs)),
        ..Default::default()
    }
}

pub fn storage(size: &str) -> StorageSpec {
    StorageSpec {
        storage_type: "dynamic".to_string(),
        access_mode: "ReadWriteOnce".to_string(),
        size: size.to_string(),
        storage_class: "standard".to_string(),
        ..Default::default()
    }
}

/// Builder for PgCluster test records
pub struct PgClusterBuilder {
    name: String,
    spec: PgClusterSpec,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    status: Option<PgClusterStatus>,
}

impl PgClusterBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            spec: PgClusterSpec {
                cluster_name: name.to_string(),
                ccp_image: "crunchy-postgres-ha".to_string(),
                ccp_image_tag: "centos8-13.1-4.6.0".to_string(),
                port: "5432".to_string(),
                user: "testuser".to_string(),
                database: name.to_string(),
                replicas: "0".to_string(),
                primary_storage: storage("1Gi"),
                replica_storage: storage("1Gi"),
                backrest_storage: storage("2Gi"),
                backrest_storage_types: vec![BackrestStorageType::Local],
                backrest_s3_verify_tls: "true".to_string(),
                ..Default::default()
            },
            labels: labels(&[(LABEL_PG_CLUSTER, name)]),
            annotations: BTreeMap::new(),
            status: None,
        }
    }

    pub fn with_storage_types(mut self, types: &[BackrestStorageType]) -> Self {
        self.spec.backrest_storage_types = types.to_vec();
        self
    }

    pub fn with_wal_storage(mut self, size: &str) -> Self {
        self.spec.wal_storage = storage(size);
        self
    }

    pub fn with_tablespace(mut self, name: &str, size: &str) -> Self {
        self.spec.tablespace_mounts.insert(name.to_string(), storage(size));
        self
    }

    pub fn with_replicas(mut self, replicas: &str) -> Self {
        self.spec.replicas = replicas.to_string();
        self
    }

    pub fn with_pgbouncer(mut self, replicas: i32) -> Self {
        self.spec.pgbouncer = PgBouncerSpec {
            replicas,
            ..Default::default()
        };
        self
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.spec.ccp_image = image.to_string();
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_current_primary(mut self, primary: &str) -> Self {
        self.annotations
            .insert(ANNOTATION_CURRENT_PRIMARY.to_string(), primary.to_string());
        self
    }

    pub fn with_state(mut self, state: ClusterState) -> Self {
        self.status = Some(PgClusterStatus {
            state,
            message: String::new(),
        });
        self
    }

    pub fn build(self) -> PgCluster {
        PgCluster {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(self.labels),
                annotations: (!self.annotations.is_empty()).then_some(self.annotations),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: self.spec,
            status: self.status,
        }
    }
}

/// Database deployment routed by `service_name`
pub fn db_deployment(name: &str, cluster: &str, service_name: &str) -> Deployment {
    let pairs = [
        (LABEL_PG_CLUSTER, cluster),
        (LABEL_PG_DATABASE, "true"),
        (LABEL_DEPLOYMENT_NAME, name),
        (LABEL_SERVICE_NAME, service_name),
    ];
    deployment(name, &pairs, 1)
}

pub fn repo_deployment(cluster: &str) -> Deployment {
    let name = backrest_repo_name(cluster);
    let pairs = [
        (LABEL_PG_CLUSTER, cluster),
        (LABEL_BACKREST_REPO, "true"),
        (LABEL_DEPLOYMENT_NAME, name.as_str()),
    ];
    deployment(&name, &pairs, 1)
}

pub fn proxy_deployment(cluster: &str) -> Deployment {
    let name = format!("{}-pgbouncer", cluster);
    let pairs = [
        (LABEL_PG_CLUSTER, cluster),
        (LABEL_PGBOUNCER, "true"),
        (LABEL_DEPLOYMENT_NAME, name.as_str()),
    ];
    deployment(&name, &pairs, 1)
}

fn deployment(name: &str, pairs: &[(&str, &str)], replicas: i32) -> Deployment {
    Deployment {
        metadata: meta(name, pairs),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            replicas: Some(replicas),
            ready_replicas: Some(replicas),
            ..Default::default()
        }),
    }
}

/// Running pod of `deployment` carrying Patroni's `role` label
pub fn pod(name: &str, deployment: &str, cluster: &str, role: &str) -> Pod {
    Pod {
        metadata: meta(
            name,
            &[
                (LABEL_PG_CLUSTER, cluster),
                (LABEL_DEPLOYMENT_NAME, deployment),
                (LABEL_ROLE, role),
            ],
        ),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod_name(deployment: &str) -> String {
    format!("{}-pod", deployment)
}

pub fn replica_record(name: &str, cluster: &str) -> PgReplica {
    PgReplica {
        metadata: meta(name, &[(LABEL_PG_CLUSTER, cluster)]),
        spec: PgReplicaSpec {
            name: name.to_string(),
            cluster_name: cluster.to_string(),
            replica_storage: storage("1Gi"),
            ..Default::default()
        },
        status: None,
    }
}

pub fn task(name: &str, task_type: TaskType, params: &[(&str, &str)]) -> PgTask {
    PgTask {
        metadata: meta(name, &[]),
        spec: PgTaskSpec {
            name: name.to_string(),
            task_type,
            parameters: labels(params),
        },
        status: None,
    }
}

pub fn pvc(name: &str, cluster: &str) -> PersistentVolumeClaim {
    generate_pvc(name, cluster, NAMESPACE, &storage("1Gi"))
}

pub fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: meta(name, &[]),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Patroni DCS record holding `config` as its JSON document
pub fn dcs_config_map(cluster: &str, config: &str) -> ConfigMap {
    let mut meta = meta(&dcs_config_map_name(cluster), &[(LABEL_PG_CLUSTER, cluster)]);
    meta.annotations = Some(labels(&[(DCS_CONFIG_ANNOTATION, config)]));
    ConfigMap {
        metadata: meta,
        ..Default::default()
    }
}

/// Names created by [`seed_cluster`]
#[derive(Debug, Clone)]
pub struct SeededCluster {
    pub cluster: PgCluster,
    pub primary: String,
    pub replicas: Vec<String>,
}

impl SeededCluster {
    pub fn name(&self) -> &str {
        &self.cluster.spec.cluster_name
    }
}

/// Store `cluster` with one primary, `replicas` replicas, their pods and volumes
pub fn seed_cluster(store: &FakeStore, cluster: PgCluster, replicas: usize) -> SeededCluster {
    let name = cluster.spec.cluster_name.clone();
    let primary = name.clone();
    let replica_names: Vec<String> = (1..=replicas).map(|i| format!("{}-rpl{}", name, i)).collect();

    let mut objects = store.objects();
    objects
        .deployments
        .insert(primary.clone(), db_deployment(&primary, &name, &name));
    objects.pods.insert(
        pod_name(&primary),
        pod(&pod_name(&primary), &primary, &name, ROLE_PRIMARY),
    );
    objects.pvcs.insert(primary.clone(), pvc(&primary, &name));

    for replica in &replica_names {
        objects.deployments.insert(
            replica.clone(),
            db_deployment(replica, &name, &replica_service_name(&name)),
        );
        objects.pods.insert(
            pod_name(replica),
            pod(&pod_name(replica), replica, &name, ROLE_REPLICA),
        );
        objects.pvcs.insert(replica.clone(), pvc(replica, &name));
    }

    let pgha = generate_pgha_config_map(&name, NAMESPACE, "false");
    objects
        .configmaps
        .insert(pgha.metadata.name.clone().unwrap_or_default(), pgha);
    objects.clusters.insert(name.clone(), cluster.clone());

    SeededCluster {
        cluster,
        primary,
        replicas: replica_names,
    }
}
