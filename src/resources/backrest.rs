//! pgBackRest repository objects used while cloning a cluster
//!
//! A clone needs three short-lived objects next to the new cluster's volumes:
//! a job that copies the source repository into the target repository volume,
//! a temporary repository host (Deployment + Service) that serves the copied
//! repository, and a delta-restore job that writes the target data volume.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::config::OperatorConfig;
use crate::crd::{BackrestStorageType, PgCluster};
use crate::resources::common::{
    ANNOTATION_CLONE_SOURCE, ANNOTATION_CLONE_TARGET, LABEL_BACKREST_REPO,
    LABEL_BACKREST_STORAGE_TYPE, LABEL_CLONE_STEP, LABEL_DEPLOYMENT_NAME, LABEL_PG_CLUSTER,
    LABEL_SERVICE_NAME,
};
use crate::resources::pvc::{backrest_repo_volume_name, data_volume_name, wal_volume_name};

/// SSH port the repository host listens on
pub const REPO_PORT: i32 = 2022;

const REPO_MOUNT: &str = "/backrestrepo";
const DATA_MOUNT: &str = "/pgdata";
const WAL_MOUNT: &str = "/pgwal";
const SECRET_MOUNT: &str = "/sshd";
const STANZA: &str = "db";

pub fn backrest_repo_name(cluster_name: &str) -> String {
    format!("{}-backrest-shared-repo", cluster_name)
}

pub fn backrest_repo_secret_name(cluster_name: &str) -> String {
    format!("{}-backrest-repo-config", cluster_name)
}

pub fn repo_sync_job_name(cluster_name: &str) -> String {
    format!("{}-repo-sync", cluster_name)
}

pub fn restore_job_name(cluster_name: &str) -> String {
    format!("{}-restore", cluster_name)
}

/// Path of a cluster's repository inside the repository volume
pub fn repo_path(cluster: &PgCluster) -> String {
    if cluster.spec.backrest_repo_path.is_empty() {
        format!("{}/{}", REPO_MOUNT, backrest_repo_name(&cluster.name_any()))
    } else {
        cluster.spec.backrest_repo_path.clone()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn pvc_volume(name: &str, claim: String) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim,
            read_only: None,
        }),
        ..Default::default()
    }
}

fn secret_volume(secret: String) -> Volume {
    Volume {
        name: "sshd".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret),
            default_mode: Some(0o400),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Object-storage environment mirrored from the source cluster
fn repo_env(source: &PgCluster, repo_type: BackrestStorageType) -> Vec<EnvVar> {
    let spec = &source.spec;
    let mut vars = vec![
        env("PGBACKREST_STANZA", STANZA),
        env("PGBACKREST_REPO1_TYPE", repo_type.as_str()),
        env("PGBACKREST_REPO1_PATH", repo_path(source)),
    ];
    match repo_type {
        BackrestStorageType::S3 => {
            vars.push(env("PGBACKREST_REPO1_S3_BUCKET", spec.backrest_s3_bucket.clone()));
            vars.push(env("PGBACKREST_REPO1_S3_ENDPOINT", spec.backrest_s3_endpoint.clone()));
            vars.push(env("PGBACKREST_REPO1_S3_REGION", spec.backrest_s3_region.clone()));
            if !spec.backrest_s3_uri_style.is_empty() {
                vars.push(env(
                    "PGBACKREST_REPO1_S3_URI_STYLE",
                    spec.backrest_s3_uri_style.clone(),
                ));
            }
        }
        BackrestStorageType::Gcs => {
            vars.push(env("PGBACKREST_REPO1_GCS_BUCKET", spec.backrest_gcs_bucket.clone()));
            vars.push(env("PGBACKREST_REPO1_GCS_ENDPOINT", spec.backrest_gcs_endpoint.clone()));
            vars.push(env("PGBACKREST_REPO1_GCS_KEY_TYPE", spec.backrest_gcs_key_type.clone()));
        }
        BackrestStorageType::Local => {}
    }
    vars
}

/// Temporary repository host for `target`, configured like the source's repository
pub fn generate_repo_deployment(
    source: &PgCluster,
    target: &str,
    namespace: &str,
    repo_type: BackrestStorageType,
    config: &OperatorConfig,
) -> Deployment {
    let name = backrest_repo_name(target);
    let labels = string_map(&[
        (LABEL_PG_CLUSTER, target),
        (LABEL_BACKREST_REPO, "true"),
        (LABEL_SERVICE_NAME, &name),
        (LABEL_DEPLOYMENT_NAME, &name),
    ]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(string_map(&[
                    (LABEL_PG_CLUSTER, target),
                    (LABEL_DEPLOYMENT_NAME, &name),
                ])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "backrest-repo".to_string(),
                        image: Some(config.pgo_image("pgo-backrest-repo")),
                        ports: Some(vec![ContainerPort {
                            container_port: REPO_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        env: Some(repo_env(source, repo_type)),
                        volume_mounts: Some(vec![
                            mount("backrestrepo", REPO_MOUNT),
                            mount("sshd", SECRET_MOUNT),
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        pvc_volume("backrestrepo", backrest_repo_volume_name(target)),
                        secret_volume(backrest_repo_secret_name(target)),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service in front of the temporary repository host; same name as the Deployment
pub fn generate_repo_service(target: &str, namespace: &str) -> Service {
    let name = backrest_repo_name(target);
    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(string_map(&[
                (LABEL_PG_CLUSTER, target),
                (LABEL_BACKREST_REPO, "true"),
            ])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(string_map(&[
                (LABEL_PG_CLUSTER, target),
                (LABEL_DEPLOYMENT_NAME, &name),
            ])),
            ports: Some(vec![ServicePort {
                name: Some("sshd".to_string()),
                port: REPO_PORT,
                target_port: Some(IntOrString::Int(REPO_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn job(
    name: String,
    namespace: &str,
    labels: BTreeMap<String, String>,
    annotations: Option<BTreeMap<String, String>>,
    container: Container,
    volumes: Vec<Volume>,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations,
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One-shot job copying the source repository into the target's repository volume
pub fn generate_repo_sync_job(
    source: &PgCluster,
    target: &str,
    namespace: &str,
    config: &OperatorConfig,
) -> Job {
    let source_name = source.name_any();
    let target_repo = backrest_repo_name(target);
    let container = Container {
        name: "repo-sync".to_string(),
        image: Some(config.pgo_image("pgo-backrest-repo-sync")),
        env: Some(vec![
            env("SOURCE_BACKREST_REPO_HOST", backrest_repo_name(&source_name)),
            env("SOURCE_BACKREST_REPO_PATH", repo_path(source)),
            env(
                "TARGET_BACKREST_REPO_PATH",
                format!("{}/{}", REPO_MOUNT, target_repo),
            ),
            env("PGBACKREST_STANZA", STANZA),
        ]),
        volume_mounts: Some(vec![
            mount("backrestrepo", REPO_MOUNT),
            mount("sshd", SECRET_MOUNT),
        ]),
        ..Default::default()
    };

    job(
        repo_sync_job_name(target),
        namespace,
        string_map(&[(LABEL_PG_CLUSTER, target), (LABEL_CLONE_STEP, "1")]),
        None,
        container,
        vec![
            pvc_volume("backrestrepo", backrest_repo_volume_name(target)),
            secret_volume(backrest_repo_secret_name(&source_name)),
        ],
    )
}

/// Options for a pgBackRest restore into a fresh data volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOptions {
    pub repo_type: BackrestStorageType,
    /// Verify the object-storage TLS certificate
    pub verify_tls: bool,
    /// `<wal dir>=<path>` relink of the WAL directory onto its own volume
    pub wal_link: Option<String>,
}

impl RestoreOptions {
    /// Command line options handed to `pgbackrest restore`
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--delta".to_string(),
            format!("--repo1-type={}", self.repo_type),
        ];
        if self.repo_type == BackrestStorageType::S3 && !self.verify_tls {
            args.push("--no-repo1-s3-verify-tls".to_string());
        }
        if let Some(link) = &self.wal_link {
            args.push(format!("--link-map={}", link));
        }
        args
    }
}

/// WAL relink target for a restored cluster
pub fn wal_link(wal_dir: &str, target: &str) -> String {
    format!("{}={}/{}", wal_dir, WAL_MOUNT, wal_volume_name(target))
}

/// Delta-restore job writing the target's data volume from the target repository
pub fn generate_restore_job(
    source: &PgCluster,
    target: &str,
    namespace: &str,
    options: &RestoreOptions,
    config: &OperatorConfig,
) -> Job {
    let source_name = source.name_any();
    let data_path = format!("{}/{}", DATA_MOUNT, data_volume_name(target));

    let mut mounts = vec![
        mount("pgdata", DATA_MOUNT),
        mount("backrestrepo", REPO_MOUNT),
        mount("sshd", SECRET_MOUNT),
    ];
    let mut volumes = vec![
        pvc_volume("pgdata", data_volume_name(target)),
        pvc_volume("backrestrepo", backrest_repo_volume_name(target)),
        secret_volume(backrest_repo_secret_name(target)),
    ];
    if options.wal_link.is_some() {
        mounts.push(mount("pgwal", WAL_MOUNT));
        volumes.push(pvc_volume("pgwal", wal_volume_name(target)));
    }

    let mut vars = repo_env(source, options.repo_type);
    vars.push(env("PGBACKREST_PG1_PATH", data_path));
    vars.push(env("PGBACKREST_REPO1_HOST", backrest_repo_name(target)));
    vars.push(env("COMMAND_OPTS", options.args().join(" ")));

    let container = Container {
        name: "restore".to_string(),
        image: Some(config.pgo_image("pgo-backrest-restore")),
        env: Some(vars),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    job(
        restore_job_name(target),
        namespace,
        string_map(&[
            (LABEL_PG_CLUSTER, target),
            (LABEL_CLONE_STEP, "2"),
            (LABEL_BACKREST_STORAGE_TYPE, options.repo_type.as_str()),
        ]),
        Some(string_map(&[
            (ANNOTATION_CLONE_SOURCE, &source_name),
            (ANNOTATION_CLONE_TARGET, target),
        ])),
        container,
        volumes,
    )
}
