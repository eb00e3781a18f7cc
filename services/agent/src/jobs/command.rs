//! `run_command`: an operator-supplied shell command.

use std::time::Duration;

use fleet_protocol::{FailureReason, RunCommand};
use serde_json::json;
use tracing::{info, warn};

use super::{JobExecutor, JobOutcome};
use crate::host::HostError;

impl JobExecutor {
    pub(super) async fn run_command(&self, payload: &RunCommand) -> JobOutcome {
        let timeout = payload
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.step_timeout)
            .min(self.settings.max_command_timeout);

        match self.host.run_shell(&payload.command, timeout).await {
            Ok(out) => {
                info!(exit_code = ?out.exit_code, bytes = out.output.len(), "Command finished");
                JobOutcome::Complete(json!({
                    "output": out.output,
                    "exit_code": out.exit_code,
                }))
            }
            Err(HostError::TimedOut(after)) => {
                warn!(?after, "Command timed out");
                JobOutcome::Failed(FailureReason::CommandTimedOut)
            }
            // The command never ran; report why as its output.
            Err(e) => {
                warn!(error = %e, "Command could not be started");
                JobOutcome::Complete(json!({
                    "output": e.to_string(),
                    "exit_code": null,
                }))
            }
        }
    }
}
