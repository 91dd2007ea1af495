use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::core::ObjectMeta;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::OperatorConfig;
use crate::resources::backrest::backrest_repo_secret_name;
use crate::resources::common::{LABEL_BACKREST_REPO, LABEL_PG_CLUSTER};

/// Combined credentials file written by older releases
pub const LEGACY_S3_CREDENTIALS_KEY: &str = "aws-s3-credentials.yaml";
pub const S3_KEY: &str = "aws-s3-key";
pub const S3_KEY_SECRET: &str = "aws-s3-key-secret";
pub const S3_CA_KEY: &str = "aws-s3-ca.crt";

/// Per-purpose secret names of a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSecretNames {
    pub primary: String,
    pub root: String,
    pub user: String,
}

impl ClusterSecretNames {
    pub fn for_cluster(cluster_name: &str, user: &str) -> Self {
        let user = if user.is_empty() { "testuser" } else { user };
        Self {
            primary: format!("{}-primaryuser-secret", cluster_name),
            root: format!("{}-postgres-secret", cluster_name),
            user: format!("{}-{}-secret", cluster_name, user),
        }
    }
}

fn repo_secret(cluster_name: &str, namespace: &str, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(backrest_repo_secret_name(cluster_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (LABEL_PG_CLUSTER.to_string(), cluster_name.to_string()),
                (LABEL_BACKREST_REPO.to_string(), "true".to_string()),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Copy of the source repository credentials scoped to `target`
pub fn copy_repo_secret(source: &Secret, target: &str, namespace: &str) -> Secret {
    repo_secret(target, namespace, source.data.clone().unwrap_or_default())
}

/// Hex SHA-256 digest of a blob
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Split the legacy combined credentials document into separate keys
fn split_legacy_credentials(raw: &[u8]) -> BTreeMap<String, ByteString> {
    match serde_yaml::from_slice::<BTreeMap<String, String>>(raw) {
        Ok(fields) => fields
            .into_iter()
            .filter(|(k, _)| k == S3_KEY || k == S3_KEY_SECRET)
            .map(|(k, v)| (k, ByteString(v.into_bytes())))
            .collect(),
        Err(e) => {
            warn!(error = %e, "could not parse legacy S3 credentials; dropping them");
            BTreeMap::new()
        }
    }
}

/// Rebuild a cluster's repository secret in the current layout
///
/// Keys from the legacy combined credentials file are split out, every other key
/// is carried forward, and a CA bundle matching a known legacy digest is
/// replaced with the currently configured bundle.
pub fn migrate_repo_secret(
    existing: &Secret,
    cluster_name: &str,
    namespace: &str,
    config: &OperatorConfig,
) -> Secret {
    let mut data = existing.data.clone().unwrap_or_default();

    if let Some(legacy) = data.remove(LEGACY_S3_CREDENTIALS_KEY) {
        for (key, value) in split_legacy_credentials(&legacy.0) {
            data.entry(key).or_insert(value);
        }
    }

    if let (Some(ca), Some(current)) = (data.get(S3_CA_KEY), &config.backrest_s3.ca_bundle) {
        let digest = sha256_hex(&ca.0);
        if config
            .legacy_s3_ca_digests
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&digest))
        {
            debug!(cluster = cluster_name, "replacing legacy S3 CA bundle");
            data.insert(
                S3_CA_KEY.to_string(),
                ByteString(current.clone().into_bytes()),
            );
        }
    }

    repo_secret(cluster_name, namespace, data)
}
