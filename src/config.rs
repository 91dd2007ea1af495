//! Operator-wide configuration
//!
//! A single immutable [`OperatorConfig`] is built at startup and handed to every
//! orchestration call through the controller context. Tests build their own with
//! `OperatorConfig::default()` and struct update syntax.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable pointing at an optional YAML configuration file
pub const CONFIG_PATH_ENV: &str = "PGO_CONFIG_PATH";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Namespace the operator itself runs in
    pub namespace: String,

    /// Version stamped onto upgraded clusters
    pub operator_version: String,

    /// Registry prefix for database images
    pub ccp_image_prefix: String,
    pub ccp_image_tag: String,

    /// Registry prefix and tag for backup tooling images
    pub pgo_image_prefix: String,
    pub pgo_image_tag: String,

    pub db_port: String,

    pub backrest_s3: S3Defaults,

    /// SHA-256 digests (hex) of CA bundles shipped by older releases
    pub legacy_s3_ca_digests: Vec<String>,

    pub wait: WaitConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "pgo".to_string(),
            operator_version: env!("CARGO_PKG_VERSION").to_string(),
            ccp_image_prefix: "registry.developers.crunchydata.com/crunchydata".to_string(),
            ccp_image_tag: "centos8-13.1-4.6.0".to_string(),
            pgo_image_prefix: "registry.developers.crunchydata.com/crunchydata".to_string(),
            pgo_image_tag: "centos8-4.6.0".to_string(),
            db_port: "5432".to_string(),
            backrest_s3: S3Defaults::default(),
            legacy_s3_ca_digests: Vec::new(),
            wait: WaitConfig::default(),
        }
    }
}

/// Object-storage settings applied where a cluster leaves them unset
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct S3Defaults {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub uri_style: String,
    pub verify_tls: String,
    /// Current CA bundle for the object-storage endpoint
    pub ca_bundle: Option<String>,
}

/// Poll period and timeouts for the readiness waiter
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WaitConfig {
    pub poll_period_secs: u64,
    pub ready_timeout_secs: u64,
    pub delete_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_period_secs: 5,
            ready_timeout_secs: 600,
            delete_timeout_secs: 300,
            connect_timeout_secs: 300,
        }
    }
}

impl WaitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl OperatorConfig {
    /// Parse a YAML document; missing keys take their defaults
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from `PGO_CONFIG_PATH` (if set) and apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                let raw = std::fs::read_to_string(Path::new(&path))
                    .map_err(|source| ConfigError::Read { path, source })?;
                Self::from_yaml(&raw)?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *target = value;
            }
        };
        set(&mut self.namespace, "POD_NAMESPACE");
        set(&mut self.ccp_image_prefix, "CCP_IMAGE_PREFIX");
        set(&mut self.ccp_image_tag, "CCP_IMAGE_TAG");
        set(&mut self.pgo_image_prefix, "PGO_IMAGE_PREFIX");
        set(&mut self.pgo_image_tag, "PGO_IMAGE_TAG");
        set(&mut self.backrest_s3.bucket, "BACKREST_S3_BUCKET");
        set(&mut self.backrest_s3.endpoint, "BACKREST_S3_ENDPOINT");
        set(&mut self.backrest_s3.region, "BACKREST_S3_REGION");
    }

    /// Fully qualified backup tooling image
    pub fn pgo_image(&self, name: &str) -> String {
        format!("{}/{}:{}", self.pgo_image_prefix, name, self.pgo_image_tag)
    }
}
