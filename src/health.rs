//! Health server for liveness, readiness and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness check (is the process alive?)
//! - `/readyz` - Readiness check (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpListener;

/// Labels for per-task metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TaskLabels {
    pub namespace: String,
    pub task_type: String,
}

impl EncodeLabelSet for TaskLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("task_type", self.task_type.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Executed tasks counter
    pub tasks_total: Family<TaskLabels, Counter>,
    /// Failed tasks counter
    pub task_errors_total: Family<TaskLabels, Counter>,
    /// Task duration histogram
    pub task_duration_seconds: Family<TaskLabels, Histogram>,
    /// Tasks currently executing
    pub tasks_in_progress: Gauge,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let tasks_total = Family::<TaskLabels, Counter>::default();
        registry.register(
            "pgha_operator_tasks",
            "Total number of executed tasks",
            tasks_total.clone(),
        );

        let task_errors_total = Family::<TaskLabels, Counter>::default();
        registry.register(
            "pgha_operator_task_errors",
            "Total number of failed tasks",
            task_errors_total.clone(),
        );

        // Tasks wait on pods and jobs, so buckets run from 100ms to ~1h
        let task_duration_seconds = Family::<TaskLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.1, 2.0, 16))
        });
        registry.register(
            "pgha_operator_task_duration_seconds",
            "Duration of task execution in seconds",
            task_duration_seconds.clone(),
        );

        let tasks_in_progress = Gauge::default();
        registry.register(
            "pgha_operator_tasks_in_progress",
            "Number of tasks currently executing",
            tasks_in_progress.clone(),
        );

        Self {
            tasks_total,
            task_errors_total,
            task_duration_seconds,
            tasks_in_progress,
            registry,
        }
    }

    fn labels(namespace: &str, task_type: &str) -> TaskLabels {
        TaskLabels {
            namespace: namespace.to_string(),
            task_type: task_type.to_string(),
        }
    }

    /// Record a task that has started executing
    pub fn task_started(&self) {
        self.tasks_in_progress.inc();
    }

    /// Record a finished task execution
    pub fn record_task(&self, namespace: &str, task_type: &str, duration_secs: f64) {
        let labels = Self::labels(namespace, task_type);
        self.tasks_in_progress.dec();
        self.tasks_total.get_or_create(&labels).inc();
        self.task_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed task execution
    pub fn record_error(&self, namespace: &str, task_type: &str) {
        self.task_errors_total
            .get_or_create(&Self::labels(namespace, task_type))
            .inc();
    }

    /// Prometheus text exposition; empty when encoding fails
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Set once leadership is held and the task controller runs
    ready: AtomicBool,
    pub metrics: Metrics,
    /// Unix timestamp of the most recently dispatched task
    last_task: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            metrics: Metrics::new(),
            last_task: AtomicU64::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_task.store(now, Ordering::Relaxed);
    }

    /// Unix timestamp of the last dispatched task, 0 if none yet
    pub fn last_task(&self) -> u64 {
        self.last_task.load(Ordering::Relaxed)
    }
}

/// Liveness handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// 503 until the task controller is running
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve health checks and metrics on `addr` until the listener fails
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
