// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Scenario tests for the orchestration operations
//!
//! Every test drives a public operation against the in-memory store, pod
//! executor and event publisher from `tests/common`:
//! - Rolling update ordering and per-instance failure handling
//! - Failover target resolution and relabelling
//! - Shutdown and startup scaling
//! - Standby enable/disable
//! - The three clone steps
//! - Upgrade migration
//! - Workflow records
//! - Task dispatch

#[path = "../common/mod.rs"]
mod common;

mod failover;
mod rolling_update;
mod scale;
mod standby;
mod workflow;
