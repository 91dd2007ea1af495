//! Standby enable/disable tests

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::Value;

use postgres_ha_operator::controller::{Error, disable_standby, enable_standby, reconcile_task};
use postgres_ha_operator::crd::{BackrestStorageType, ClusterState, TaskType, params};
use postgres_ha_operator::resources::EventKind;
use postgres_ha_operator::resources::patroni::{
    PGHA_BOOTSTRAP_REPO_TYPE, STANDBY_SECTION, dcs_config, dcs_config_map_name,
    pgha_config_map_name,
};

use crate::common::*;

const DCS: &str = r#"{"loop_wait":10,"postgresql":{"parameters":{"max_connections":100}}}"#;

fn stored_dcs(h: &Harness) -> Value {
    let objects = h.store.objects();
    let config = dcs_config(&objects.configmaps[&dcs_config_map_name("hippo")]).unwrap();
    serde_json::from_str(config).unwrap()
}

fn bootstrap_repo_type(h: &Harness) -> Option<String> {
    h.store.objects().configmaps[&pgha_config_map_name("hippo")]
        .data
        .as_ref()
        .and_then(|d| d.get(PGHA_BOOTSTRAP_REPO_TYPE).cloned())
}

fn seed_standby_candidate(h: &Harness, state: ClusterState) -> SeededCluster {
    let seeded = seed_cluster(
        &h.store,
        PgClusterBuilder::new("hippo")
            .with_storage_types(&[BackrestStorageType::Local, BackrestStorageType::S3])
            .with_state(state)
            .build(),
        1,
    );
    let dcs = dcs_config_map(seeded.name(), DCS);
    h.store
        .objects()
        .configmaps
        .insert(dcs_config_map_name("hippo"), dcs);
    seeded
}

#[tokio::test]
async fn test_running_cluster_is_rejected() {
    let h = Harness::new();
    seed_standby_candidate(&h, ClusterState::Initialized);
    let task = task(
        "hippo-enable-standby",
        TaskType::EnableStandby,
        &[(params::CLUSTER, "hippo")],
    );

    let err = reconcile_task(Arc::new(task), Arc::new(h.ctx()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ClusterNotShutdown(ref name) if name == "hippo"));
    assert!(h.store.calls("delete_pvc").is_empty());
    assert!(h.store.calls("create_pvc").is_empty());
    let event = h.events.single(EventKind::TaskFailed);
    assert_eq!(event.cluster, "hippo");
    assert!(event.message.contains("must be shut down first"), "{}", event.message);
    assert_eq!(h.events.kinds(), vec![EventKind::TaskFailed]);
}

#[tokio::test]
async fn test_local_only_storage_is_rejected() {
    let h = Harness::new();
    let seeded = seed_cluster(
        &h.store,
        PgClusterBuilder::new("hippo")
            .with_state(ClusterState::Shutdown)
            .build(),
        1,
    );

    let err = enable_standby(&h.ctx(), &seeded.cluster).await.unwrap_err();

    assert!(matches!(err, Error::ValidationError(_)), "{:?}", err);
    assert!(h.store.calls("delete_pvc").is_empty());
}

#[tokio::test]
async fn test_enable_recreates_volumes_and_rewrites_configuration() {
    let h = Harness::new();
    let seeded = seed_standby_candidate(&h, ClusterState::Shutdown);

    enable_standby(&h.ctx(), &seeded.cluster).await.unwrap();

    assert_eq!(h.store.calls("delete_pvc"), vec!["hippo", "hippo-rpl1"]);
    assert_eq!(h.store.calls("create_pvc"), vec!["hippo", "hippo-rpl1"]);
    let last_delete = h.position("delete_pvc hippo-rpl1").unwrap();
    let first_create = h.position("create_pvc hippo").unwrap();
    assert!(last_delete < first_create);

    let dcs = stored_dcs(&h);
    let standby = &dcs[STANDBY_SECTION];
    assert!(
        standby["restore_command"]
            .as_str()
            .unwrap()
            .contains("--repo1-type=s3")
    );
    assert_eq!(dcs["loop_wait"], 10);

    assert_eq!(bootstrap_repo_type(&h).as_deref(), Some("s3"));
    assert!(h.store.objects().clusters["hippo"].spec.standby);
    assert_eq!(h.events.kinds(), vec![EventKind::StandbyEnabled]);
}

#[tokio::test]
async fn test_enable_then_disable_restores_configuration() {
    let h = Harness::new();
    let seeded = seed_standby_candidate(&h, ClusterState::Shutdown);
    let ctx = h.ctx();
    let before = stored_dcs(&h);

    enable_standby(&ctx, &seeded.cluster).await.unwrap();
    let stored = h.store.objects().clusters["hippo"].clone();
    disable_standby(&ctx, &stored).await.unwrap();

    assert_eq!(stored_dcs(&h), before);
    assert_eq!(bootstrap_repo_type(&h), None);
    assert!(!h.store.objects().clusters["hippo"].spec.standby);
    assert_eq!(
        h.events.kinds(),
        vec![EventKind::StandbyEnabled, EventKind::StandbyDisabled]
    );
}

#[tokio::test]
async fn test_disable_without_standby_section_leaves_configuration() {
    let h = Harness::new();
    let seeded = seed_standby_candidate(&h, ClusterState::Initialized);

    disable_standby(&h.ctx(), &seeded.cluster).await.unwrap();

    assert!(
        h.store
            .calls("patch_configmap")
            .iter()
            .all(|name| *name != dcs_config_map_name("hippo"))
    );
    assert_eq!(h.events.kinds(), vec![EventKind::StandbyDisabled]);
}
