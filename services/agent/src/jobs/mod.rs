//! Job execution on the agent.
//!
//! A job arrives as a raw [`JobAssignment`]; it is parsed into a
//! [`JobSpec`] and handed to the matching handler. Handlers never return
//! errors: every failure becomes a [`FailureReason`] reported to the control
//! plane.

mod command;
mod deploy;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{FailureReason, JobAssignment, JobSpec};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::artifact::{ArtifactSource, SignatureVerifier};
use crate::config::Config;
use crate::host::ServiceHost;

/// How a job ended on this host.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Complete(Value),
    Failed(FailureReason),
}

/// Filesystem and timing settings the handlers need.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub work_dir: PathBuf,
    pub deploy_dir: PathBuf,
    pub keep_backups: usize,
    pub smoke_attempts: u32,
    pub smoke_delay: Duration,
    pub step_timeout: Duration,
    /// Ceiling for a `run_command` job, whatever its payload asks for.
    pub max_command_timeout: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            deploy_dir: config.deploy_dir.clone(),
            keep_backups: config.keep_backups,
            smoke_attempts: config.smoke_attempts,
            smoke_delay: config.smoke_delay,
            step_timeout: config.step_timeout,
            max_command_timeout: config.max_command_timeout,
        }
    }

    fn backups_dir(&self) -> PathBuf {
        self.work_dir.join("backups")
    }
}

/// Runs jobs against this host.
pub struct JobExecutor {
    settings: ExecutorSettings,
    artifacts: Arc<dyn ArtifactSource>,
    host: Arc<dyn ServiceHost>,
    verifier: Option<SignatureVerifier>,
}

impl JobExecutor {
    /// Without a verifier every `deploy_bundle` fails signature verification.
    pub fn new(
        settings: ExecutorSettings,
        artifacts: Arc<dyn ArtifactSource>,
        host: Arc<dyn ServiceHost>,
        verifier: Option<SignatureVerifier>,
    ) -> Self {
        Self {
            settings,
            artifacts,
            host,
            verifier,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    pub async fn execute(&self, job: &JobAssignment) -> JobOutcome {
        let spec = match job.spec() {
            Ok(spec) => spec,
            Err(e) => {
                warn!(error = %e, "Rejecting job");
                return JobOutcome::Failed(FailureReason::from(&e));
            }
        };

        info!("Executing job");
        match spec {
            JobSpec::DeployBundle(payload) => self.deploy_bundle(&job.id.to_string(), &payload).await,
            JobSpec::RunCommand(payload) => self.run_command(&payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeArtifacts, FakeHost};
    use fleet_id::JobId;
    use serde_json::json;

    fn executor(dir: &std::path::Path) -> JobExecutor {
        let settings = ExecutorSettings {
            work_dir: dir.join("work"),
            deploy_dir: dir.join("current"),
            keep_backups: 5,
            smoke_attempts: 1,
            smoke_delay: Duration::ZERO,
            step_timeout: Duration::from_secs(5),
            max_command_timeout: Duration::from_secs(30),
        };
        JobExecutor::new(settings, Arc::new(FakeArtifacts::default()), Arc::new(FakeHost::default()), None)
    }

    #[tokio::test]
    async fn test_unknown_job_type() {
        let tmp = tempfile::TempDir::new().unwrap();
        let job = JobAssignment {
            id: JobId::new(),
            job_type: "reboot".to_string(),
            payload: json!({}),
        };
        assert_eq!(
            executor(tmp.path()).execute(&job).await,
            JobOutcome::Failed(FailureReason::UnknownJobType)
        );
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let tmp = tempfile::TempDir::new().unwrap();
        let job = JobAssignment {
            id: JobId::new(),
            job_type: "deploy_bundle".to_string(),
            payload: json!({"artifact_url": 42}),
        };
        assert_eq!(
            executor(tmp.path()).execute(&job).await,
            JobOutcome::Failed(FailureReason::InvalidPayload)
        );
    }
}
