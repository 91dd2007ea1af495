use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use postgres_ha_operator::health::{HealthState, run_health_server};
use postgres_ha_operator::{OperatorConfig, run_task_controller};

const LEASE_NAME: &str = "postgres-ha-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// In-flight tasks get this long after SIGTERM
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Set to a namespace to watch tasks only there
const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";
const HEALTH_ADDR_ENV: &str = "HEALTH_ADDR";
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Lease held by this replica of the operator
struct Leadership {
    client: Client,
    namespace: String,
    holder_id: String,
}

impl Leadership {
    fn lock(&self) -> LeaseLock {
        LeaseLock::new(
            self.client.clone(),
            &self.namespace,
            LeaseLockParams {
                holder_id: self.holder_id.clone(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        )
    }

    /// Block until this replica holds the lease
    async fn acquire(&self) {
        let lock = self.lock();
        loop {
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!(holder_id = %self.holder_id, "Acquired leadership");
                    return;
                }
                Ok(_) => info!("Another replica holds the lease, waiting"),
                Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
            }
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        }
    }

    /// Keep renewing; losing the lease exits the process so it re-enters election on restart
    fn spawn_renewal(&self) -> JoinHandle<()> {
        let lock = self.lock();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
                match lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {}
                    Ok(_) => {
                        error!("Lost leadership, exiting");
                        std::process::exit(1);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to renew lease, exiting");
                        std::process::exit(1);
                    }
                }
            }
        })
    }
}

fn holder_id() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    })
}

fn install_crypto_provider() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("no rustls crypto provider available".into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_crypto_provider()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("postgres_ha_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    let config = OperatorConfig::load()?;
    info!(
        version = %config.operator_version,
        namespace = %config.namespace,
        "Starting postgres-ha-operator"
    );

    let health_addr: SocketAddr = std::env::var(HEALTH_ADDR_ENV)
        .unwrap_or_else(|_| DEFAULT_HEALTH_ADDR.to_string())
        .parse()?;
    let watch_namespace = std::env::var(WATCH_NAMESPACE_ENV)
        .ok()
        .filter(|ns| !ns.is_empty());

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    // Health checks answer while waiting for the lease
    let health_handle = tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = run_health_server(health_state, health_addr).await {
                error!(error = %e, "Health server failed");
            }
        }
    });

    let leadership = Leadership {
        client: client.clone(),
        namespace: config.namespace.clone(),
        holder_id: holder_id(),
    };
    leadership.acquire().await;
    let renewal_handle = leadership.spawn_renewal();

    let controller_handle = tokio::spawn({
        let health_state = health_state.clone();
        async move {
            run_task_controller(
                client,
                config,
                Some(health_state),
                watch_namespace.as_deref(),
            )
            .await;
        }
    });

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Task controller panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server panicked");
            }
        }
        Err(e) = renewal_handle => {
            error!(error = %e, "Lease renewal panicked");
        }
        _ = shutdown_signal() => {
            info!(grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(), "Shutting down");
            health_state.set_ready(false);
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Resolves on SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
