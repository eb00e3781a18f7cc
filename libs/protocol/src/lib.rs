//! # fleet-protocol
//!
//! Wire types shared by the control plane, the agents and the operator CLI.
//!
//! ## Envelope
//!
//! Every call to the control plane is a `POST` of
//! `{service, action, payload}` to the gatekeeper endpoint, authenticated by
//! the [`TOKEN_HEADER`] header. Replies are `{success: true, result}` or
//! `{success: false, error}`.
//!
//! ## Services
//!
//! - `Fleet::Agent`: `register`, `heartbeat`, `poll_jobs`, `job_complete`,
//!   `job_failed`
//! - `Fleet::Deployer`: `provision_tenant`, `reboot_tenant`, `schedule_rollout`,
//!   `get_rollout`, `enqueue_job`, `list_jobs`
//!
//! Envelopes decode into the tagged [`Request`] enum, so an unknown service or
//! action is rejected before any handler runs.

mod actions;
mod envelope;
mod error;
mod jobs;
mod model;

pub use actions::*;
pub use envelope::*;
pub use error::ProtocolError;
pub use jobs::*;
pub use model::*;
