//! # fleet-id
//!
//! Typed identifiers for the fleet control plane.
//!
//! Every ID is `{prefix}_{ulid}`:
//! - `tnt_01HV4Z2WQXKJNM8GPQY6VBKC3D` (tenant)
//! - `job_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (job)
//! - `rol_01HV4Z4NYPLTRS0JTUA8XDME5F` (rollout)
//!
//! The prefix keeps a tenant id from being passed where a job id is expected,
//! and the ULID keeps ids sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
