//! Failover tests

use kube::ResourceExt;

use postgres_ha_operator::controller::{Error, failover};
use postgres_ha_operator::crd::{TaskState, TaskType, params};
use postgres_ha_operator::resources::EventKind;
use postgres_ha_operator::resources::common::{ANNOTATION_CURRENT_PRIMARY, LABEL_SERVICE_NAME};

use crate::common::*;

fn failover_task(h: &Harness, target: &str) -> postgres_ha_operator::PgTask {
    let task = task(
        "hippo-failover",
        TaskType::Failover,
        &[(params::CLUSTER, "hippo"), (params::FAILOVER_TARGET, target)],
    );
    h.store
        .objects()
        .tasks
        .insert(task.name_any(), task.clone());
    task
}

#[tokio::test]
async fn test_failover_to_pod_repoints_primary() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 1);
    let replica_pod = pod_name(&seeded.replicas[0]);
    let task = failover_task(&h, &replica_pod);

    failover(&h.ctx(), &replica_pod, &seeded.cluster, &task)
        .await
        .unwrap();

    // Promotion is requested from the live primary
    let commands = h.executor.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].0, pod_name("hippo"));
    assert_eq!(
        commands[0].1,
        format!("patronictl failover --candidate {} --force", replica_pod)
    );

    let objects = h.store.objects();
    assert_eq!(
        objects.clusters["hippo"]
            .annotations()
            .get(ANNOTATION_CURRENT_PRIMARY)
            .map(String::as_str),
        Some("hippo-rpl1")
    );
    assert_eq!(
        objects.pods[&replica_pod]
            .labels()
            .get(LABEL_SERVICE_NAME)
            .map(String::as_str),
        Some("hippo")
    );
    assert_eq!(
        objects.deployments["hippo-rpl1"]
            .labels()
            .get(LABEL_SERVICE_NAME)
            .map(String::as_str),
        Some("hippo")
    );
    assert_eq!(objects.tasks["hippo-failover"].state(), TaskState::Completed);
    drop(objects);

    let event = h.events.single(EventKind::FailoverCompleted);
    assert!(event.message.contains("hippo-rpl1"));
}

#[tokio::test]
async fn test_failover_to_deployment_name() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 2);
    let task = failover_task(&h, "hippo-rpl2");

    failover(&h.ctx(), "hippo-rpl2", &seeded.cluster, &task)
        .await
        .unwrap();

    assert_eq!(
        h.executor.commands()[0].1,
        "patronictl failover --candidate hippo-rpl2-pod --force"
    );
    assert_eq!(
        h.store.objects().clusters["hippo"]
            .annotations()
            .get(ANNOTATION_CURRENT_PRIMARY)
            .map(String::as_str),
        Some("hippo-rpl2")
    );
    // The other replica keeps its routing
    assert_eq!(
        h.store.objects().deployments["hippo-rpl1"]
            .labels()
            .get(LABEL_SERVICE_NAME)
            .map(String::as_str),
        Some("hippo-replica")
    );
}

#[tokio::test]
async fn test_unknown_target_is_not_found() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 1);
    let task = failover_task(&h, "nope");

    let err = failover(&h.ctx(), "nope", &seeded.cluster, &task)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotFound(_)), "{:?}", err);
    assert!(h.executor.commands().is_empty());
    assert!(h.store.calls("patch_cluster").is_empty());
    assert!(h.events.events().is_empty());
    assert_eq!(h.store.objects().tasks["hippo-failover"].state(), TaskState::Pending);
}

#[tokio::test]
async fn test_failed_promotion_request_still_repoints() {
    let h = Harness::new();
    let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), 1);
    h.executor.fail_in(&pod_name("hippo"));
    let task = failover_task(&h, "hippo-rpl1");

    failover(&h.ctx(), "hippo-rpl1", &seeded.cluster, &task)
        .await
        .unwrap();

    assert_eq!(
        h.store.objects().clusters["hippo"]
            .annotations()
            .get(ANNOTATION_CURRENT_PRIMARY)
            .map(String::as_str),
        Some("hippo-rpl1")
    );
    assert_eq!(h.events.kinds(), vec![EventKind::FailoverCompleted]);
}
