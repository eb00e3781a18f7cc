//! Job kinds, statuses and failure reasons.

use fleet_id::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Kind of work a job asks an agent to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DeployBundle,
    RunCommand,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DeployBundle => "deploy_bundle",
            JobType::RunCommand => "run_command",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploy_bundle" => Some(JobType::DeployBundle),
            "run_command" => Some(JobType::RunCommand),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
///
/// `Pending → Claimed → Complete | Failed`. The last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `deploy_bundle` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployBundle {
    pub artifact_url: String,
    pub signature_url: String,
}

/// Payload of a `run_command` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    pub command: String,

    /// Overrides the agent's step timeout for this command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// A validated job: kind plus its typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job_type", content = "payload", rename_all = "snake_case")]
pub enum JobSpec {
    DeployBundle(DeployBundle),
    RunCommand(RunCommand),
}

impl JobSpec {
    /// Parses a raw `(job_type, payload)` pair as stored or sent on the wire.
    pub fn parse(job_type: &str, payload: Value) -> Result<Self, ProtocolError> {
        let kind =
            JobType::parse(job_type).ok_or_else(|| ProtocolError::UnknownJobType(job_type.to_string()))?;

        let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload {
            job_type: job_type.to_string(),
            reason: e.to_string(),
        };

        match kind {
            JobType::DeployBundle => serde_json::from_value(payload)
                .map(JobSpec::DeployBundle)
                .map_err(invalid),
            JobType::RunCommand => serde_json::from_value(payload)
                .map(JobSpec::RunCommand)
                .map_err(invalid),
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobSpec::DeployBundle(_) => JobType::DeployBundle,
            JobSpec::RunCommand(_) => JobType::RunCommand,
        }
    }

    /// The payload as a JSON object, in the shape stored on the job row.
    pub fn payload(&self) -> Value {
        let encoded = match self {
            JobSpec::DeployBundle(p) => serde_json::to_value(p),
            JobSpec::RunCommand(p) => serde_json::to_value(p),
        };
        encoded.unwrap_or(Value::Null)
    }
}

/// A job as handed to an agent by `poll_jobs`.
///
/// `job_type` stays a plain string so an agent older than the control plane
/// can still see, and fail, a kind it does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl JobAssignment {
    pub fn spec(&self) -> Result<JobSpec, ProtocolError> {
        JobSpec::parse(&self.job_type, self.payload.clone())
    }
}

/// Reason codes recorded as a failed job's error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    DownloadFailed,
    SignatureVerificationFailed,
    UntarFailed,
    SwapFailed,
    SmokeTestFailed,
    UnknownJobType,
    InvalidPayload,
    CommandTimedOut,
    LeaseExpired,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::DownloadFailed => "download_failed",
            FailureReason::SignatureVerificationFailed => "signature_verification_failed",
            FailureReason::UntarFailed => "untar_failed",
            FailureReason::SwapFailed => "swap_failed",
            FailureReason::SmokeTestFailed => "smoke_test_failed",
            FailureReason::UnknownJobType => "unknown_job_type",
            FailureReason::InvalidPayload => "invalid_payload",
            FailureReason::CommandTimedOut => "command_timed_out",
            FailureReason::LeaseExpired => "lease_expired",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ProtocolError> for FailureReason {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownJobType(_) => FailureReason::UnknownJobType,
            _ => FailureReason::InvalidPayload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_parse_deploy_bundle() {
        let spec = JobSpec::parse(
            "deploy_bundle",
            json!({"artifact_url": "https://a/b.tgz", "signature_url": "https://a/b.sig"}),
        )
        .unwrap();
        assert_eq!(spec.job_type(), JobType::DeployBundle);
        assert_eq!(spec.payload()["artifact_url"], "https://a/b.tgz");
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = JobSpec::parse("reboot_host", json!({})).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownJobType(ref t) if t == "reboot_host"));
        assert_eq!(FailureReason::from(&err), FailureReason::UnknownJobType);
    }

    #[test]
    fn test_parse_invalid_payload() {
        let err = JobSpec::parse("run_command", json!({"cmd": "ls"})).unwrap_err();
        assert_eq!(err.code(), "invalid_payload");
        assert_eq!(FailureReason::from(&err), FailureReason::InvalidPayload);
    }

    #[test]
    fn test_assignment_uses_type_key() {
        let assignment = JobAssignment {
            id: JobId::new(),
            job_type: "run_command".to_string(),
            payload: json!({"command": "uptime"}),
        };
        let value = serde_json::to_value(&assignment).unwrap();
        assert_eq!(value["type"], "run_command");
        assert!(matches!(assignment.spec().unwrap(), JobSpec::RunCommand(_)));
    }

    #[rstest]
    #[case(JobStatus::Pending, false)]
    #[case(JobStatus::Claimed, false)]
    #[case(JobStatus::Complete, true)]
    #[case(JobStatus::Failed, true)]
    fn test_terminal_statuses(#[case] status: JobStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }
}
