//! Command execution inside running pods
//!
//! Used for Patroni control (`patronictl`), readiness checks and version
//! detection. The Kubernetes implementation goes through the exec subresource.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, AttachParams};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::controller::{Error, Result};

/// Captured output of a command that exited successfully
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    /// Run `command` in `container` of `pod`, optionally feeding `stdin`
    ///
    /// A non-zero exit is returned as [`Error::ExecFailed`].
    async fn exec<'a>(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Option<&'a str>,
    ) -> Result<ExecOutput>;
}

/// [`PodExecutor`] over the Kubernetes exec API
#[derive(Clone)]
pub struct KubePodExecutor {
    client: Client,
}

impl KubePodExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor for KubePodExecutor {
    async fn exec<'a>(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Option<&'a str>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let failed = |message: String| Error::ExecFailed {
            pod: pod.to_string(),
            message,
        };

        let attach_params = AttachParams {
            container: Some(container.to_string()),
            stdin: true,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        debug!(pod, container, command = ?command, "exec in pod");
        let mut attached = pods.exec(pod, command.to_vec(), &attach_params).await?;

        if let Some(mut writer) = attached.stdin() {
            if let Some(input) = stdin {
                writer
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| failed(e.to_string()))?;
            }
            // Close stdin to signal end of input
            writer.shutdown().await.map_err(|e| failed(e.to_string()))?;
        }

        let stdout = attached
            .stdout()
            .ok_or_else(|| failed("Failed to get stdout from exec".to_string()))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| failed("Failed to get stderr from exec".to_string()))?;

        let stdout_output = read_stream(stdout).await.map_err(|e| failed(e.to_string()))?;
        let stderr_output = read_stream(stderr).await.map_err(|e| failed(e.to_string()))?;

        let status = attached
            .take_status()
            .ok_or_else(|| failed("Failed to get status from exec".to_string()))?;

        if let Some(status) = status.await
            && status.status.as_deref() != Some("Success")
        {
            let message = if stderr_output.is_empty() {
                format!("Command failed with status: {:?}", status.message)
            } else {
                stderr_output
            };
            return Err(failed(message));
        }

        Ok(ExecOutput {
            stdout: stdout_output,
            stderr: stderr_output,
        })
    }
}

/// Read all data from an async read stream
async fn read_stream<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> std::io::Result<String> {
    use tokio::io::AsyncReadExt;

    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}
