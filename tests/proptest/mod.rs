// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for orchestration ordering and pure helpers
//!
//! These tests use proptest to generate random cluster shapes and inputs and
//! verify that:
//! 1. A rolling update touches every instance exactly once, replicas first
//! 2. Task status never moves backwards on any event sequence
//! 3. Primary resolution always picks the most trusted non-empty source
//! 4. The standby section round-trips through the DCS configuration
//! 5. Upgraded cluster records never carry obsolete labels

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use proptest::prelude::*;
use serde_json::{Map, Value};

use postgres_ha_operator::OperatorConfig;
use postgres_ha_operator::controller::primary::{PrimaryEvidence, RESOLVERS, first_non_empty};
use postgres_ha_operator::controller::rolling_update;
use postgres_ha_operator::controller::state_machine::{TaskEvent, TaskStateMachine};
use postgres_ha_operator::controller::upgrade::upgraded_cluster;
use postgres_ha_operator::crd::{BackrestStorageType, TaskState};
use postgres_ha_operator::resources::Selector;
use postgres_ha_operator::resources::common::{
    LABEL_ROLE, LEGACY_LABEL_COLLECT, OBSOLETE_LABELS, ROLE_PRIMARY,
};
use postgres_ha_operator::resources::patroni::{
    STANDBY_SECTION, add_standby_section, parse_major_version, remove_standby_section,
    wal_dir_for_major,
};

use common::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn rank(state: TaskState) -> u8 {
    match state {
        TaskState::Pending => 0,
        TaskState::InProgress => 1,
        TaskState::Completed => 2,
    }
}

// =============================================================================
// Strategies
// =============================================================================

/// Live role flags for a cluster's instances; index 0 is the original primary
fn instance_roles() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 1..=6)
}

fn task_events() -> impl Strategy<Value = Vec<TaskEvent>> {
    prop::collection::vec(
        prop_oneof![Just(TaskEvent::Started), Just(TaskEvent::Finished)],
        0..10,
    )
}

fn maybe_name() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some(String::new())),
        "[a-z]{1,8}(-[a-z0-9]{4})?".prop_map(Some),
    ]
}

/// Flat DCS documents without a standby section
fn dcs_document() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z_]{1,12}", 0..1000i64, 0..6).prop_map(|fields| {
        fields
            .into_iter()
            .filter(|(k, _)| k != STANDBY_SECTION)
            .map(|(k, v)| (k, Value::from(v)))
            .collect()
    })
}

fn label_set() -> impl Strategy<Value = BTreeMap<String, String>> {
    let obsolete = prop::sample::subsequence(OBSOLETE_LABELS.to_vec(), 0..=OBSOLETE_LABELS.len());
    (obsolete, any::<bool>(), "[a-z]{1,6}").prop_map(|(obsolete, collect, extra)| {
        let mut labels: BTreeMap<String, String> = obsolete
            .into_iter()
            .map(|k| (k.to_string(), "x".to_string()))
            .collect();
        if collect {
            labels.insert(LEGACY_LABEL_COLLECT.to_string(), "true".to_string());
        }
        labels.insert(format!("user-{}", extra), "kept".to_string());
        labels
    })
}

// =============================================================================
// Rolling update ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn rolling_update_touches_every_instance_once(roles in instance_roles()) {
        let h = Harness::new();
        let seeded = seed_cluster(&h.store, PgClusterBuilder::new("hippo").build(), roles.len() - 1);
        let instances: Vec<String> = std::iter::once(seeded.primary.clone())
            .chain(seeded.replicas.iter().cloned())
            .collect();

        {
            let mut objects = h.store.objects();
            for (name, is_primary) in instances.iter().zip(&roles) {
                let role = if *is_primary { ROLE_PRIMARY } else { "replica" };
                objects
                    .pods
                    .get_mut(&pod_name(name))
                    .unwrap()
                    .labels_mut()
                    .insert(LABEL_ROLE.to_string(), role.to_string());
            }
        }

        runtime()
            .block_on(rolling_update(&h.ctx(), &seeded.cluster, |_, _: &mut Deployment| Ok(())))
            .unwrap();

        let mut replaced = h.store.calls("replace_deployment");
        replaced.sort();
        let mut expected = instances.clone();
        expected.sort();
        prop_assert_eq!(replaced, expected);

        let primaries: Vec<&String> = instances
            .iter()
            .zip(&roles)
            .filter(|(_, p)| **p)
            .map(|(n, _)| n)
            .collect();
        let replicas: Vec<&String> = instances
            .iter()
            .zip(&roles)
            .filter(|(_, p)| !**p)
            .map(|(n, _)| n)
            .collect();

        let switchover = h
            .journal()
            .iter()
            .position(|e| e.contains("patronictl switchover"));

        if primaries.len() == 1 && !replicas.is_empty() {
            let switchover = switchover.unwrap();
            for replica in &replicas {
                let replace = h.position(&format!("replace_deployment {}", replica)).unwrap();
                prop_assert!(replace < switchover);
            }
            let primary = h.position(&format!("replace_deployment {}", primaries[0])).unwrap();
            prop_assert!(switchover < primary);
        } else {
            prop_assert!(switchover.is_none());
        }

        // Every primary comes after every replica regardless of switchover
        for primary in &primaries {
            let p = h.position(&format!("replace_deployment {}", primary)).unwrap();
            for replica in &replicas {
                let r = h.position(&format!("replace_deployment {}", replica)).unwrap();
                prop_assert!(r < p);
            }
        }
    }
}

// =============================================================================
// Task lifecycle
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn task_state_never_moves_backwards(events in task_events()) {
        let fsm = TaskStateMachine::new();
        let mut state = TaskState::Pending;
        for event in events {
            let result = fsm.transition(state, event);
            if let Some(next) = result.target() {
                prop_assert!(rank(next) > rank(state));
                state = next;
            }
        }
        prop_assert!(fsm.valid_events(TaskState::Completed).is_empty());
    }
}

// =============================================================================
// Primary resolution
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn primary_resolution_prefers_trusted_sources(
        live in maybe_name(),
        annotation in maybe_name(),
        legacy in maybe_name(),
    ) {
        let evidence = PrimaryEvidence {
            live_pod_deployment: live.clone(),
            annotation: annotation.clone(),
            legacy_label: legacy.clone(),
        };
        let expected = [live, annotation, legacy]
            .into_iter()
            .flatten()
            .find(|v| !v.is_empty())
            .unwrap_or_else(|| "hippo".to_string());
        prop_assert_eq!(first_non_empty(&evidence, RESOLVERS, "hippo"), expected);
    }

    #[test]
    fn wal_directory_follows_major_version(major in 8u32..20, minor in 0u32..30) {
        let output = format!("postgres (PostgreSQL) {}.{}", major, minor);
        let parsed = parse_major_version(&output).unwrap();
        prop_assert_eq!(parsed, major);
        let expected = if major >= 10 { "pg_wal" } else { "pg_xlog" };
        prop_assert_eq!(wal_dir_for_major(parsed), expected);
    }
}

// =============================================================================
// Standby configuration
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn standby_section_round_trips(doc in dcs_document(), s3 in any::<bool>()) {
        let repo_type = if s3 { BackrestStorageType::S3 } else { BackrestStorageType::Gcs };
        let original = serde_json::to_string(&doc).unwrap();

        let enabled = add_standby_section(&original, repo_type).unwrap().unwrap();
        prop_assert!(add_standby_section(&enabled, repo_type).unwrap().is_none());

        let disabled = remove_standby_section(&enabled).unwrap().unwrap();
        let round_tripped: Value = serde_json::from_str(&disabled).unwrap();
        prop_assert_eq!(round_tripped, Value::Object(doc));
        prop_assert!(remove_standby_section(&disabled).unwrap().is_none());
    }
}

// =============================================================================
// Upgrade records and selectors
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn upgraded_cluster_drops_obsolete_labels(labels in label_set(), replicas in 0usize..10) {
        let mut builder = PgClusterBuilder::new("hippo");
        for (k, v) in &labels {
            builder = builder.with_label(k, v);
        }
        let cluster = builder.build();
        let config = OperatorConfig {
            operator_version: "4.6.0".to_string(),
            ..Default::default()
        };

        let upgraded = upgraded_cluster(&cluster, "hippo", replicas, None, &config);

        for obsolete in OBSOLETE_LABELS {
            prop_assert!(!upgraded.labels().contains_key(*obsolete));
        }
        prop_assert!(!upgraded.labels().contains_key(LEGACY_LABEL_COLLECT));
        prop_assert_eq!(upgraded.spec.replicas.clone(), replicas.to_string());
        for (k, v) in labels.iter().filter(|(k, _)| k.starts_with("user-")) {
            prop_assert_eq!(upgraded.labels().get(k), Some(v));
        }
    }

    #[test]
    fn selector_matches_any_superset(
        required in prop::collection::btree_map("[a-z]{1,6}", "[a-z]{1,6}", 0..4),
        extra in prop::collection::btree_map("[A-Z]{1,6}", "[a-z]{1,6}", 0..4),
    ) {
        let selector = required
            .iter()
            .fold(Selector::default(), |s, (k, v)| s.with(k, v));
        let mut labels = required.clone();
        labels.extend(extra);
        prop_assert!(selector.matches(Some(&labels)));

        if let Some((k, v)) = required.iter().next() {
            let mut wrong = labels.clone();
            wrong.insert(k.clone(), format!("{}-other", v));
            prop_assert!(!selector.matches(Some(&wrong)));
            prop_assert!(!selector.matches(None));
        }
    }
}
