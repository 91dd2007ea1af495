//! Error types for the orchestration core

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix where they wrap a lower layer
/// (e.g., `KubeError`, `SerializationError`); orchestration failures are named for
/// the condition they report.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Cluster {0} must be shut down first")]
    ClusterNotShutdown(String),

    #[error("Cluster {0} already exists")]
    ClusterExists(String),

    #[error(
        "Backup storage type {requested} is not available on cluster {cluster} (storage types: {available})"
    )]
    StorageTypeMismatch {
        cluster: String,
        requested: String,
        available: String,
    },

    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    #[error("Command failed in pod {pod}: {message}")]
    ExecFailed { pod: String, message: String },

    #[error("Task parameter {0} is required")]
    MissingParameter(&'static str),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Expected exactly one primary for cluster {cluster}, found {found}")]
    AmbiguousPrimary { cluster: String, found: usize },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::TransientError(_) => true,
            Error::Timeout { .. } => true,
            Error::ExecFailed { .. } => true,
            Error::NotFound(_) => true,
            Error::PermanentError(_) => false,
            Error::ValidationError(_) => false,
            Error::SerializationError(_) => false,
            Error::ClusterNotShutdown(_) => false,
            Error::ClusterExists(_) => false,
            Error::StorageTypeMismatch { .. } => false,
            Error::MissingParameter(_) => false,
            Error::InvalidTask(_) => false,
            Error::AmbiguousPrimary { .. } => false,
        }
    }

    /// Whether the error means the object is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Whether the error means the object already exists
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Fraction of the delay randomized either way, in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Jittered exponential delay, capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let spread = base * self.jitter;
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * spread;
        let secs = (base + offset)
            .max(0.0)
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Errors that will not heal on their own wait the full `max_delay`
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
