//! Blocking poll loops for readiness, deletion and connectivity
//!
//! Every waiter polls one target at a fixed period until its condition holds or
//! the timeout elapses, then returns [`Error::Timeout`]. Errors while observing
//! the target count as "not yet" and are logged at debug level.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::controller::{Error, Result};
use crate::resources::common::{LABEL_DEPLOYMENT_NAME, Selector};
use crate::resources::patroni::{DATABASE_CONTAINER, is_accepting_connections, readiness_command};
use crate::resources::{ClusterStore, PodExecutor};

/// Poll `check` every `period` until it yields true or `timeout` elapses
pub async fn poll_until<F, Fut>(
    what: &str,
    period: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => debug!(target_object = what, error = %e, "poll check failed"),
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::Timeout {
                what: what.to_string(),
                elapsed,
            });
        }
        tokio::time::sleep(period.min(timeout - elapsed)).await;
    }
}

/// Wait until deployment `name` has as many ready replicas as it wants
#[instrument(skip(store))]
pub async fn wait_ready(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
    period: Duration,
    timeout: Duration,
) -> Result<()> {
    poll_until(&format!("deployment {} ready", name), period, timeout, || async move {
        let Some(deployment) = store.get_deployment(namespace, name).await? else {
            return Ok(false);
        };
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        Ok(ready == desired)
    })
    .await
}

/// Wait until deployment `name` and the service of the same name are both gone
#[instrument(skip(store))]
pub async fn wait_deleted(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
    period: Duration,
    timeout: Duration,
) -> Result<()> {
    poll_until(&format!("deployment {} deleted", name), period, timeout, || async move {
        let deployment = store.get_deployment(namespace, name).await?;
        let service = store.get_service(namespace, name).await?;
        Ok(deployment.is_none() && service.is_none())
    })
    .await
}

/// Wait until deployment `name` is gone, whatever happens to its service
#[instrument(skip(store))]
pub async fn wait_deployment_deleted(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
    period: Duration,
    timeout: Duration,
) -> Result<()> {
    poll_until(&format!("deployment {} deleted", name), period, timeout, || async move {
        Ok(store.get_deployment(namespace, name).await?.is_none())
    })
    .await
}

/// Wait until the volume claim `name` is gone
#[instrument(skip(store))]
pub async fn wait_pvc_deleted(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
    period: Duration,
    timeout: Duration,
) -> Result<()> {
    poll_until(&format!("volume {} deleted", name), period, timeout, || async move {
        Ok(store.get_pvc(namespace, name).await?.is_none())
    })
    .await
}

/// Wait until PostgreSQL in a running pod of deployment `name` accepts connections
#[allow(clippy::too_many_arguments)]
#[instrument(skip(store, executor))]
pub async fn wait_accepting_connections(
    store: &dyn ClusterStore,
    executor: &dyn PodExecutor,
    namespace: &str,
    name: &str,
    port: &str,
    period: Duration,
    timeout: Duration,
) -> Result<()> {
    let selector = Selector::default()
        .with(LABEL_DEPLOYMENT_NAME, name)
        .running();
    let command = readiness_command(port);
    let selector = &selector;
    let command = &command;

    poll_until(
        &format!("deployment {} accepting connections", name),
        period,
        timeout,
        || async move {
            let pods = store.list_pods(namespace, selector).await?;
            let Some(pod_name) = pods.first().and_then(|p| p.metadata.name.clone()) else {
                return Ok(false);
            };
            let output = executor
                .exec(namespace, &pod_name, DATABASE_CONTAINER, command, None)
                .await?;
            Ok(is_accepting_connections(&output.stdout))
        },
    )
    .await
}
