//! Rolling update tests

use std::sync::{Arc, Mutex};

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;

use postgres_ha_operator::controller::{Error, rolling_update};
use postgres_ha_operator::crd::PgCluster;
use postgres_ha_operator::resources::EventKind;
use postgres_ha_operator::resources::common::{ROLE_PRIMARY, ROLE_REPLICA};

use crate::common::*;

/// Mutation that records which deployments it was applied to
fn recorder() -> (
    Arc<Mutex<Vec<String>>>,
    impl Fn(&PgCluster, &mut Deployment) -> postgres_ha_operator::Result<()> + Send + Sync,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let mutate = move |_: &PgCluster, d: &mut Deployment| {
        log.lock().unwrap().push(d.name_any());
        d.labels_mut()
            .insert("mutated".to_string(), "true".to_string());
        Ok(())
    };
    (seen, mutate)
}

fn mutated(h: &Harness, name: &str) -> bool {
    h.store.objects().deployments[name]
        .labels()
        .get("mutated")
        .is_some_and(|v| v == "true")
}

#[tokio::test]
async fn test_replicas_before_switchover_before_primary() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 2);
    let (seen, mutate) = recorder();

    rolling_update(&h.ctx(), &seeded.cluster, mutate).await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen.last(), Some(&seeded.primary));

    let switchover = h
        .journal()
        .iter()
        .position(|e| e.starts_with("exec hippo-pod patronictl switchover"))
        .expect("switchover requested");
    let primary_replace = h.position("replace_deployment hippo").unwrap();
    for replica in &seeded.replicas {
        let replace = h
            .position(&format!("replace_deployment {}", replica))
            .unwrap();
        assert!(replace < switchover, "{} updated after switchover", replica);
        assert!(mutated(&h, replica));
    }
    assert!(switchover < primary_replace);
    assert!(mutated(&h, "hippo"));
    assert_eq!(h.events.kinds(), vec![EventKind::RollingUpdateCompleted]);
}

#[tokio::test]
async fn test_replica_is_stopped_then_checked() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 1);
    let (_, mutate) = recorder();

    rolling_update(&h.ctx(), &seeded.cluster, mutate).await.unwrap();

    let replica_pod = pod_name(&seeded.replicas[0]);
    let stop = h
        .journal()
        .iter()
        .position(|e| e.starts_with(&format!("exec {} bash -c pg_ctl stop", replica_pod)))
        .expect("database stopped");
    let replace = h.position("replace_deployment hippo-rpl1").unwrap();
    let ready_check = h
        .journal()
        .iter()
        .position(|e| e.starts_with(&format!("exec {} pg_isready", replica_pod)))
        .expect("readiness checked");
    assert!(stop < replace);
    assert!(replace < ready_check);
}

#[tokio::test]
async fn test_no_live_primary_skips_switchover() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 2);
    // Patroni has not elected anyone
    h.store
        .objects()
        .pods
        .get_mut(&pod_name("hippo"))
        .unwrap()
        .labels_mut()
        .insert("role".to_string(), ROLE_REPLICA.to_string());
    let (seen, mutate) = recorder();

    rolling_update(&h.ctx(), &seeded.cluster, mutate).await.unwrap();

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["hippo", "hippo-rpl1", "hippo-rpl2"]);
    assert!(
        !h.executor
            .commands()
            .iter()
            .any(|(_, cmd)| cmd.contains("switchover"))
    );
}

#[tokio::test]
async fn test_two_live_primaries_skip_switchover() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 2);
    h.store
        .objects()
        .pods
        .get_mut(&pod_name("hippo-rpl1"))
        .unwrap()
        .labels_mut()
        .insert("role".to_string(), ROLE_PRIMARY.to_string());
    let (seen, mutate) = recorder();

    rolling_update(&h.ctx(), &seeded.cluster, mutate).await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    for name in ["hippo", "hippo-rpl1", "hippo-rpl2"] {
        assert_eq!(seen.iter().filter(|s| *s == name).count(), 1);
    }
    assert!(
        !h.executor
            .commands()
            .iter()
            .any(|(_, cmd)| cmd.contains("switchover"))
    );
}

#[tokio::test]
async fn test_mutation_failure_skips_only_that_instance() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 2);

    rolling_update(&h.ctx(), &seeded.cluster, |_, d: &mut Deployment| {
        if d.name_any() == "hippo-rpl1" {
            return Err(Error::ValidationError("cannot mutate".to_string()));
        }
        d.labels_mut()
            .insert("mutated".to_string(), "true".to_string());
        Ok(())
    })
    .await
    .unwrap();

    assert!(h.store.calls("replace_deployment").iter().all(|n| n != "hippo-rpl1"));
    assert!(mutated(&h, "hippo-rpl2"));
    assert!(mutated(&h, "hippo"));
}

#[tokio::test]
async fn test_replace_failure_continues_with_remaining_instances() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 2);
    h.store.fail_on("replace_deployment", "hippo-rpl1");
    let (_, mutate) = recorder();

    rolling_update(&h.ctx(), &seeded.cluster, mutate).await.unwrap();

    assert!(!mutated(&h, "hippo-rpl1"));
    assert!(mutated(&h, "hippo-rpl2"));
    assert!(mutated(&h, "hippo"));
    assert_eq!(h.events.kinds(), vec![EventKind::RollingUpdateCompleted]);
}

#[tokio::test]
async fn test_primary_only_cluster_is_updated_without_switchover() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 0);
    let (seen, mutate) = recorder();

    rolling_update(&h.ctx(), &seeded.cluster, mutate).await.unwrap();

    assert_eq!(seen.lock().unwrap().clone(), vec!["hippo"]);
    assert!(h.executor.commands().is_empty());
}
