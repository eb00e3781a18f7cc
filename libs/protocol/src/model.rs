//! Records owned by the control plane, in their wire shape.

use chrono::{DateTime, Utc};
use fleet_id::{JobId, RolloutId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{JobAssignment, JobStatus, JobType};

/// A provisioned compute instance bound to a customer slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub slug: String,
    pub ip: String,
    pub provider_instance_id: String,
    pub plan: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of work targeted at a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_slug: String,
    pub job_type: JobType,
    #[serde(default)]
    pub payload: Value,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub rollout_id: Option<RolloutId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn assignment(&self) -> JobAssignment {
        JobAssignment {
            id: self.id,
            job_type: self.job_type.as_str().to_string(),
            payload: self.payload.clone(),
        }
    }

    /// The recorded error of a failed job.
    pub fn error(&self) -> Option<&str> {
        self.result.get("error").and_then(Value::as_str)
    }
}

/// Host metrics reported with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    #[serde(default)]
    pub load_1m: Option<f64>,
    #[serde(default)]
    pub free_mem_kb: Option<u64>,
    #[serde(default)]
    pub disk_free_kb: Option<u64>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

/// Latest snapshot of an agent, overwritten by each register and heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantAgent {
    pub agent_id: String,
    #[serde(default)]
    pub tenant_slug: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub metrics: Option<HostMetrics>,
    pub last_seen: DateTime<Utc>,
}

/// Where a staged rollout stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    /// Batches are still being created.
    Running,
    /// Every batch was created.
    Completed,
    /// Stopped early after a failed job.
    Halted,
    /// The control plane stopped before the last batch.
    Interrupted,
    /// Creating a batch hit a storage error.
    Failed,
}

impl RolloutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStatus::Running => "running",
            RolloutStatus::Completed => "completed",
            RolloutStatus::Halted => "halted",
            RolloutStatus::Interrupted => "interrupted",
            RolloutStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, RolloutStatus::Running)
    }
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable progress of a staged rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub id: RolloutId,
    pub artifact_url: String,
    pub signature_url: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub tenant_slugs: Vec<String>,
    pub batch_size: usize,
    pub pause_secs: u64,
    pub halt_on_failure: bool,
    pub status: RolloutStatus,
    /// Jobs created so far.
    #[serde(default)]
    pub created: usize,
    /// Batches created so far.
    #[serde(default)]
    pub batches: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rollout {
    /// Tenants whose job was never created.
    pub fn remaining(&self) -> usize {
        self.tenant_slugs.len().saturating_sub(self.created)
    }
}
