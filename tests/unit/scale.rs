//! Shutdown and startup tests

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use postgres_ha_operator::controller::{ScaleTargets, scale_cluster_deployments, shutdown, startup};
use postgres_ha_operator::crd::ClusterState;
use postgres_ha_operator::resources::EventKind;
use postgres_ha_operator::resources::common::ANNOTATION_CURRENT_PRIMARY;
use postgres_ha_operator::resources::patroni::{PGHA_AUTOFAIL, pgha_config_map_name};

use crate::common::*;

fn desired(h: &Harness, name: &str) -> Option<i32> {
    h.store.objects().deployments[name]
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
}

fn autofail(h: &Harness) -> Option<String> {
    h.store.objects().configmaps[&pgha_config_map_name("hippo")]
        .data
        .as_ref()
        .and_then(|d| d.get(PGHA_AUTOFAIL).cloned())
}

fn cluster_state(h: &Harness) -> Option<ClusterState> {
    h.store.objects().clusters["hippo"]
        .status
        .as_ref()
        .map(|s| s.state)
}

/// Cluster with two replicas, a backup repository and a two-instance proxy
fn seed_full(h: &Harness) -> SeededCluster {
    let seeded = seed_cluster(
        &h.store,
        PgClusterBuilder::new("hippo").with_pgbouncer(2).build(),
        2,
    );
    let mut objects = h.store.objects();
    let repo = repo_deployment("hippo");
    objects.deployments.insert(repo.name_any(), repo);
    let proxy = proxy_deployment("hippo");
    objects.deployments.insert(proxy.name_any(), proxy);
    objects.configmaps.insert(
        "hippo-leader".to_string(),
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("hippo-leader".to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    seeded
}

#[tokio::test]
async fn test_shutdown_then_startup() {
    let h = Harness::new();
    let seeded = seed_full(&h);
    let ctx = h.ctx();

    shutdown(&ctx, &seeded.cluster).await.unwrap();

    for name in ["hippo", "hippo-rpl1", "hippo-rpl2", "hippo-backrest-shared-repo", "hippo-pgbouncer"] {
        assert_eq!(desired(&h, name), Some(0), "{} still running", name);
    }
    assert_eq!(autofail(&h).as_deref(), Some("false"));
    assert!(!h.store.objects().configmaps.contains_key("hippo-leader"));
    assert_eq!(cluster_state(&h), Some(ClusterState::Shutdown));
    assert_eq!(
        h.store.objects().clusters["hippo"]
            .annotations()
            .get(ANNOTATION_CURRENT_PRIMARY)
            .map(String::as_str),
        Some("hippo")
    );

    let stored = h.store.objects().clusters["hippo"].clone();
    startup(&ctx, &stored).await.unwrap();

    assert_eq!(desired(&h, "hippo"), Some(1));
    assert_eq!(desired(&h, "hippo-backrest-shared-repo"), Some(1));
    assert_eq!(desired(&h, "hippo-pgbouncer"), Some(2));
    assert_eq!(desired(&h, "hippo-rpl1"), Some(0));
    assert_eq!(desired(&h, "hippo-rpl2"), Some(0));
    assert_eq!(autofail(&h).as_deref(), Some("true"));
    assert_eq!(cluster_state(&h), Some(ClusterState::Initialized));

    assert_eq!(
        h.events.kinds(),
        vec![EventKind::ClusterShutdown, EventKind::ClusterStartup]
    );
}

#[tokio::test]
async fn test_shutdown_disables_autofail_before_scaling() {
    let h = Harness::new();
    let seeded = seed_full(&h);

    shutdown(&h.ctx(), &seeded.cluster).await.unwrap();

    let autofail = h
        .position(&format!("patch_configmap {}", pgha_config_map_name("hippo")))
        .unwrap();
    let first_scale = h
        .journal()
        .iter()
        .position(|e| e.starts_with("scale_deployment "))
        .unwrap();
    assert!(autofail < first_scale);
}

#[tokio::test]
async fn test_failed_scale_continues_with_the_rest() {
    let h = Harness::new();
    let seeded = seed_full(&h);
    h.store.fail_on("scale_deployment", "hippo-rpl1=0");

    let summary = scale_cluster_deployments(&h.ctx(), &seeded.cluster, 0, ScaleTargets::ALL)
        .await
        .unwrap();

    assert_eq!(desired(&h, "hippo-rpl1"), Some(1));
    assert_eq!(desired(&h, "hippo-rpl2"), Some(0));
    assert_eq!(desired(&h, "hippo"), Some(0));
    assert_eq!(summary.primary, vec!["hippo"]);
    assert_eq!(summary.replicas, vec!["hippo-rpl1", "hippo-rpl2"]);
    assert_eq!(summary.repos, vec!["hippo-backrest-shared-repo"]);
    assert_eq!(summary.proxies, vec!["hippo-pgbouncer"]);
}

#[tokio::test]
async fn test_shutdown_without_single_primary_keeps_annotation() {
    let h = Harness::new();
    let seeded = seed_cluster(
        &h.store,
        PgClusterBuilder::new("hippo")
            .with_current_primary("hippo-rpl1")
            .build(),
        1,
    );
    // The primary pod is gone
    h.store.objects().pods.remove(&pod_name("hippo"));

    shutdown(&h.ctx(), &seeded.cluster).await.unwrap();

    assert_eq!(
        h.store.objects().clusters["hippo"]
            .annotations()
            .get(ANNOTATION_CURRENT_PRIMARY)
            .map(String::as_str),
        Some("hippo-rpl1")
    );
    assert!(h.store.calls("patch_cluster").is_empty());
    assert_eq!(cluster_state(&h), Some(ClusterState::Shutdown));
}
