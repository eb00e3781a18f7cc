//! Action payloads for the two gatekeeper services.

use fleet_id::RolloutId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{HostMetrics, Job, JobAssignment, JobStatus};

fn default_poll_limit() -> u32 {
    10
}

fn default_plan() -> String {
    "standard".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_pause_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Fleet::Agent
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub hostname: String,
    pub local_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub ok: bool,
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    #[serde(default)]
    pub metrics: HostMetrics,
    /// Agent clock, seconds since the epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    /// Reserved for pushed commands; always empty today.
    #[serde(default)]
    pub commands: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollJobsRequest {
    pub agent_id: String,
    pub tenant_slug: String,
    #[serde(default = "default_poll_limit")]
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollJobsResponse {
    pub jobs: Vec<JobAssignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleteRequest {
    pub agent_id: String,
    pub job_id: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailedRequest {
    pub agent_id: String,
    pub job_id: String,
    pub error: String,
}

/// Plain acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub const OK: Ack = Ack { ok: true };
}

/// Every action of the `Fleet::Agent` service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum AgentAction {
    Register(RegisterRequest),
    Heartbeat(HeartbeatRequest),
    PollJobs(PollJobsRequest),
    JobComplete(JobCompleteRequest),
    JobFailed(JobFailedRequest),
}

impl AgentAction {
    pub fn name(&self) -> &'static str {
        match self {
            AgentAction::Register(_) => "register",
            AgentAction::Heartbeat(_) => "heartbeat",
            AgentAction::PollJobs(_) => "poll_jobs",
            AgentAction::JobComplete(_) => "job_complete",
            AgentAction::JobFailed(_) => "job_failed",
        }
    }
}

// =============================================================================
// Fleet::Deployer
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionTenantRequest {
    pub slug: String,
    #[serde(default = "default_plan")]
    pub plan: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRolloutRequest {
    pub artifact_url: String,
    pub signature_url: String,
    pub tenants: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_pause_secs")]
    pub pause_secs: u64,
    #[serde(default = "default_true")]
    pub halt_on_failure: bool,
    /// Release tag, for operators reading the rollout later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRolloutResponse {
    pub scheduled: bool,
    pub count: usize,
    pub rollout_id: RolloutId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRolloutRequest {
    pub rollout_id: RolloutId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebootTenantRequest {
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueJobRequest {
    pub tenant_slug: String,
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListJobsRequest {
    pub tenant_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
}

/// Every action of the `Fleet::Deployer` service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum DeployerAction {
    ProvisionTenant(ProvisionTenantRequest),
    RebootTenant(RebootTenantRequest),
    ScheduleRollout(ScheduleRolloutRequest),
    GetRollout(GetRolloutRequest),
    EnqueueJob(EnqueueJobRequest),
    ListJobs(ListJobsRequest),
}

impl DeployerAction {
    pub fn name(&self) -> &'static str {
        match self {
            DeployerAction::ProvisionTenant(_) => "provision_tenant",
            DeployerAction::RebootTenant(_) => "reboot_tenant",
            DeployerAction::ScheduleRollout(_) => "schedule_rollout",
            DeployerAction::GetRollout(_) => "get_rollout",
            DeployerAction::EnqueueJob(_) => "enqueue_job",
            DeployerAction::ListJobs(_) => "list_jobs",
        }
    }
}

// =============================================================================
// CI webhook
// =============================================================================

/// Body of `POST /webhook/ci`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiWebhookRequest {
    pub artifact_url: String,
    pub signature_url: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiWebhookResponse {
    /// Always `"scheduled"`.
    pub result: String,
    pub tag: String,
    pub rollout_id: RolloutId,
    pub count: usize,
}
