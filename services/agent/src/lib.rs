//! Fleet agent library.
//!
//! Runs on every tenant host. The agent registers with the control plane,
//! heartbeats with host metrics, polls for jobs and executes them:
//!
//! - `deploy_bundle`: signed release tarball, installed with backup, atomic
//!   swap, smoke test and rollback
//! - `run_command`: a shell command with merged output and a timeout

pub mod artifact;
pub mod bundle;
pub mod client;
pub mod config;
pub mod host;
pub mod identity;
pub mod jobs;
pub mod metrics;
pub mod runtime;

#[cfg(test)]
mod testing;
