//! Fleet control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod agents;
pub mod api;
pub mod config;
pub mod db;
pub mod deployer;
pub mod jobs;
pub mod provider;
pub mod reaper;
pub mod rollouts;
pub mod state;
pub mod tenants;
