//! Patroni distributed-configuration records and in-pod commands
//!
//! Patroni keeps its cluster-wide configuration in the `<cluster>-config`
//! ConfigMap (a JSON document in the `config` annotation) and its leader lock in
//! `<cluster>-leader`. The operator also keeps a `<cluster>-pgha-config`
//! ConfigMap with settings the instances read at bootstrap.
//!
//! Reference: https://github.com/patroni/patroni

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use serde_json::{Map, Value};

use crate::crd::BackrestStorageType;
use crate::resources::common::{LABEL_PG_CLUSTER, LABEL_PGHA_SCOPE};

/// Container running PostgreSQL and Patroni
pub const DATABASE_CONTAINER: &str = "database";

/// Annotation on the DCS ConfigMap holding the JSON configuration
pub const DCS_CONFIG_ANNOTATION: &str = "config";

/// Section of the DCS configuration that turns a cluster into a standby
pub const STANDBY_SECTION: &str = "standby_cluster";

/// PGHA ConfigMap keys
pub const PGHA_INIT: &str = "init";
pub const PGHA_AUTOFAIL: &str = "autofail";
pub const PGHA_BOOTSTRAP_REPO_TYPE: &str = "bootstrap-repo-type";

/// Replica creation method that restores from the backup repository
const STANDBY_REPLICA_METHOD: &str = "pgbackrest_standby";

pub fn dcs_config_map_name(cluster_name: &str) -> String {
    format!("{}-config", cluster_name)
}

pub fn leader_config_map_name(cluster_name: &str) -> String {
    format!("{}-leader", cluster_name)
}

pub fn pgha_config_map_name(cluster_name: &str) -> String {
    format!("{}-pgha-config", cluster_name)
}

/// PGHA key caching the last rendered DCS configuration
pub fn pgha_dcs_snapshot_key(cluster_name: &str) -> String {
    format!("{}-dcs-config", cluster_name)
}

/// Generate the PGHA ConfigMap for a cluster
///
/// `init` tells the instances whether bootstrap still has to run; an existing
/// cluster must carry `false` forward so Patroni does not initialize again.
pub fn generate_pgha_config_map(cluster_name: &str, namespace: &str, init: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(pgha_config_map_name(cluster_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (LABEL_PG_CLUSTER.to_string(), cluster_name.to_string()),
                (LABEL_PGHA_SCOPE.to_string(), cluster_name.to_string()),
            ])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (PGHA_INIT.to_string(), init.to_string()),
            (PGHA_AUTOFAIL.to_string(), "true".to_string()),
        ])),
        ..Default::default()
    }
}

/// Read the DCS configuration document from its ConfigMap
pub fn dcs_config(config_map: &ConfigMap) -> Option<&str> {
    config_map
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DCS_CONFIG_ANNOTATION))
        .map(String::as_str)
}

fn parse_object(config: &str) -> Result<Map<String, Value>, serde_json::Error> {
    if config.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(config)
}

/// Standby section streaming from a remote repository of `repo_type`
pub fn standby_section(repo_type: BackrestStorageType) -> Value {
    serde_json::json!({
        "create_replica_methods": [STANDBY_REPLICA_METHOD],
        "restore_command": format!(
            "source /opt/crunchy/bin/postgres-ha/pgbackrest/pgbackrest-set-env.sh && \
             pgbackrest archive-get %f \"%p\" --repo1-type={}",
            repo_type
        ),
    })
}

/// Add the standby section to a DCS configuration document
///
/// Returns `None` when the section is already present.
pub fn add_standby_section(
    config: &str,
    repo_type: BackrestStorageType,
) -> Result<Option<String>, serde_json::Error> {
    let mut doc = parse_object(config)?;
    if doc.contains_key(STANDBY_SECTION) {
        return Ok(None);
    }
    doc.insert(STANDBY_SECTION.to_string(), standby_section(repo_type));
    serde_json::to_string(&doc).map(Some)
}

/// Remove the standby section from a DCS configuration document
///
/// Returns `None` when there was nothing to remove.
pub fn remove_standby_section(config: &str) -> Result<Option<String>, serde_json::Error> {
    let mut doc = parse_object(config)?;
    if doc.remove(STANDBY_SECTION).is_none() {
        return Ok(None);
    }
    serde_json::to_string(&doc).map(Some)
}

fn command(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Ask Patroni to promote `candidate`
pub fn failover_command(candidate: &str) -> Vec<String> {
    command(&["patronictl", "failover", "--candidate", candidate, "--force"])
}

/// Planned switchover away from `primary`; Patroni picks the best candidate
pub fn switchover_command(primary: &str) -> Vec<String> {
    command(&["patronictl", "switchover", "--master", primary, "--force"])
}

/// Fast clean shutdown of the local PostgreSQL server
pub fn stop_postgres_command() -> Vec<String> {
    command(&["bash", "-c", "pg_ctl stop -m fast -D \"$PGDATA\""])
}

/// Local readiness check
pub fn readiness_command(port: &str) -> Vec<String> {
    command(&["pg_isready", "-h", "localhost", "-p", port])
}

/// Whether `pg_isready` output means the server takes connections
pub fn is_accepting_connections(output: &str) -> bool {
    output.contains("accepting connections")
}

pub fn version_command() -> Vec<String> {
    command(&["postgres", "--version"])
}

/// Parse the leading version number from `postgres --version` output
///
/// `postgres (PostgreSQL) 12.4` gives 12 and `postgres (PostgreSQL) 9.6.19`
/// gives 9; only the boundary at 10 matters to callers.
pub fn parse_major_version(output: &str) -> Option<u32> {
    let version = output.split_whitespace().last()?;
    let digits: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// WAL directory name for a PostgreSQL major version
///
/// `pg_xlog` was renamed to `pg_wal` in PostgreSQL 10.
pub fn wal_dir_for_major(major: u32) -> &'static str {
    if major >= 10 { "pg_wal" } else { "pg_xlog" }
}
