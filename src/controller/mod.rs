pub mod classify;
pub mod cleanup;
pub mod clone;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod primary;
pub mod rolling;
pub mod scale;
pub mod standby;
pub mod state_machine;
pub mod status;
pub mod upgrade;
pub mod wait;
pub mod workflow;

pub use clone::run_clone_step;
pub use context::Context;
pub use dispatch::{error_policy, reconcile_task};
pub use error::{BackoffConfig, Error, Result};
pub use failover::failover;
pub use rolling::rolling_update;
pub use scale::{ScaleSummary, ScaleTargets, scale_cluster_deployments, shutdown, startup};
pub use standby::{disable_standby, enable_standby};
pub use upgrade::run_upgrade;
