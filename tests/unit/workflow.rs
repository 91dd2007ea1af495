//! Workflow record tests

use kube::ResourceExt;

use postgres_ha_operator::controller::workflow::{
    create_workflow_task, get_workflow, steps, update_workflow,
};
use postgres_ha_operator::crd::{TaskType, params};
use postgres_ha_operator::resources::common::{LABEL_OWNER, LABEL_WORKFLOW_ID};

use crate::common::*;

#[tokio::test]
async fn test_create_then_update() {
    let h = Harness::new();
    let store = h.store.as_ref();

    let id = create_workflow_task(store, NAMESPACE, "dst", "clone", "admin")
        .await
        .unwrap();

    let workflow = get_workflow(store, NAMESPACE, &id).await.unwrap();
    assert_eq!(workflow.task_name, "dst-clone");
    assert!(workflow.step(steps::SUBMITTED).is_some());
    assert!(workflow.step(steps::CLONE_STEP1_COMPLETED).is_none());
    assert_eq!(
        workflow.parameters.get(params::WORKFLOW_ID).map(String::as_str),
        Some(id.as_str())
    );

    update_workflow(store, NAMESPACE, &id, steps::CLONE_STEP1_COMPLETED)
        .await
        .unwrap();
    let workflow = get_workflow(store, NAMESPACE, &id).await.unwrap();
    assert!(workflow.step(steps::CLONE_STEP1_COMPLETED).is_some());
    assert!(workflow.step(steps::SUBMITTED).is_some());

    let objects = h.store.objects();
    let record = &objects.tasks["dst-clone"];
    assert_eq!(record.spec.task_type, TaskType::Workflow);
    assert_eq!(record.labels().get(LABEL_OWNER).map(String::as_str), Some("admin"));
    assert_eq!(record.labels().get(LABEL_WORKFLOW_ID), Some(&id));
}

#[tokio::test]
async fn test_recreating_replaces_the_record() {
    let h = Harness::new();
    let store = h.store.as_ref();

    let first = create_workflow_task(store, NAMESPACE, "dst", "clone", "")
        .await
        .unwrap();
    let second = create_workflow_task(store, NAMESPACE, "dst", "clone", "")
        .await
        .unwrap();

    assert_ne!(first, second);
    assert!(get_workflow(store, NAMESPACE, &first).await.unwrap_err().is_not_found());
    assert!(get_workflow(store, NAMESPACE, &second).await.is_ok());
    assert!(
        !h.store.objects().tasks["dst-clone"]
            .labels()
            .contains_key(LABEL_OWNER)
    );
}

#[tokio::test]
async fn test_unknown_workflow_is_not_found() {
    let h = Harness::new();

    let err = update_workflow(h.store.as_ref(), NAMESPACE, "nope", steps::UPGRADE_COMPLETED)
        .await
        .unwrap_err();

    assert!(err.is_not_found());
}
