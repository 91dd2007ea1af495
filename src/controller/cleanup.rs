//! Best-effort execution of independent teardown actions
//!
//! Each action runs regardless of whether earlier ones failed. Failures are
//! collected and logged together when the caller calls [`CleanupLog::finish`].

use std::future::Future;

use tracing::{debug, warn};

use crate::controller::{Error, Result};

/// Collected outcome of a sequence of cleanup actions
#[derive(Debug, Default)]
pub struct CleanupLog {
    scope: String,
    completed: Vec<String>,
    errors: Vec<(String, Error)>,
}

impl CleanupLog {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Default::default()
        }
    }

    /// Run one action, recording its failure instead of returning it
    pub async fn run<T, Fut>(&mut self, action: &str, fut: Fut) -> Option<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match fut.await {
            Ok(value) => {
                debug!(scope = %self.scope, action, "cleanup step done");
                self.completed.push(action.to_string());
                Some(value)
            }
            Err(e) => {
                warn!(scope = %self.scope, action, error = %e, "cleanup step failed");
                self.errors.push((action.to_string(), e));
                None
            }
        }
    }

    pub fn errors(&self) -> &[(String, Error)] {
        &self.errors
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Log a summary and hand back the failures
    pub fn finish(self) -> Vec<(String, Error)> {
        if self.errors.is_empty() {
            debug!(scope = %self.scope, steps = self.completed.len(), "cleanup finished");
        } else {
            let failed: Vec<&str> = self.errors.iter().map(|(a, _)| a.as_str()).collect();
            warn!(
                scope = %self.scope,
                steps = self.completed.len(),
                failed = ?failed,
                "cleanup finished with errors"
            );
        }
        self.errors
    }
}
