//! The agent main loop.
//!
//! ```text
//! Starting ──register──▶ Registered ──▶ (Heartbeat ⇄ Poll ⇄ Execute)* ──▶ Stopped
//! ```
//!
//! Registration happens once at startup. If it fails the loop starts anyway
//! and each tick makes one more attempt until it succeeds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use fleet_protocol::{
    HeartbeatRequest, JobAssignment, JobCompleteRequest, JobFailedRequest, PollJobsRequest,
    RegisterRequest,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ControlPlane;
use crate::identity::AgentIdentity;
use crate::jobs::{JobExecutor, JobOutcome};
use crate::metrics;

/// Jobs requested per poll.
const POLL_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Registered,
    Heartbeat,
    Poll,
    Execute,
    Stopped,
}

pub struct Agent {
    identity: AgentIdentity,
    tenant_slug: String,
    poll_interval: Duration,
    /// Filesystem whose free space is reported.
    disk_path: PathBuf,
    control: Arc<dyn ControlPlane>,
    executor: JobExecutor,
    registered: bool,
    phase: Phase,
}

impl Agent {
    pub fn new(
        identity: AgentIdentity,
        tenant_slug: String,
        poll_interval: Duration,
        disk_path: PathBuf,
        control: Arc<dyn ControlPlane>,
        executor: JobExecutor,
    ) -> Self {
        Self {
            identity,
            tenant_slug,
            poll_interval,
            disk_path,
            control,
            executor,
            registered: false,
            phase: Phase::Starting,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// One registration attempt. Failures are logged, never returned.
    pub async fn register(&mut self) -> bool {
        let request = RegisterRequest {
            agent_id: self.identity.agent_id.clone(),
            hostname: self.identity.hostname.clone(),
            local_ip: self.identity.local_ip.clone(),
            tenant_slug: Some(self.tenant_slug.clone()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };

        match self.control.register(request).await {
            Ok(response) => {
                info!(agent_id = %response.agent_id, "Registered with control plane");
                self.registered = true;
                self.phase = Phase::Registered;
            }
            Err(e) => warn!(error = %e, "Registration failed; will retry next tick"),
        }
        self.registered
    }

    /// One iteration: heartbeat, poll, then execute and report each job.
    ///
    /// Returns the number of jobs handled. A heartbeat or poll error ends the
    /// iteration early; report errors are logged per job.
    pub async fn tick(&mut self) -> Result<usize> {
        if !self.registered {
            self.register().await;
        }

        self.phase = Phase::Heartbeat;
        let heartbeat = HeartbeatRequest {
            agent_id: self.identity.agent_id.clone(),
            metrics: metrics::sample(&self.disk_path),
            timestamp: Utc::now().timestamp(),
        };
        let response = self.control.heartbeat(heartbeat).await?;
        if !response.commands.is_empty() {
            info!(count = response.commands.len(), "Ignoring heartbeat commands");
        }

        self.phase = Phase::Poll;
        let polled = self
            .control
            .poll_jobs(PollJobsRequest {
                agent_id: self.identity.agent_id.clone(),
                tenant_slug: self.tenant_slug.clone(),
                limit: POLL_LIMIT,
            })
            .await?;
        debug!(jobs = polled.jobs.len(), "Polled jobs");

        self.phase = Phase::Execute;
        for job in &polled.jobs {
            let outcome = self.executor.execute(job).await;
            self.report(job, outcome).await;
        }
        Ok(polled.jobs.len())
    }

    async fn report(&self, job: &JobAssignment, outcome: JobOutcome) {
        let agent_id = self.identity.agent_id.clone();
        let job_id = job.id.to_string();

        let reported = match outcome {
            JobOutcome::Complete(result) => {
                info!(job_id = %job_id, "Job complete");
                self.control
                    .job_complete(JobCompleteRequest {
                        agent_id,
                        job_id: job_id.clone(),
                        result,
                    })
                    .await
            }
            JobOutcome::Failed(reason) => {
                warn!(job_id = %job_id, reason = %reason, "Job failed");
                self.control
                    .job_failed(JobFailedRequest {
                        agent_id,
                        job_id: job_id.clone(),
                        error: reason.to_string(),
                    })
                    .await
            }
        };

        if let Err(e) = reported {
            warn!(job_id = %job_id, error = %e, "Failed to report job outcome");
        }
    }

    /// Runs until `shutdown` flips to `true`.
    #[instrument(skip(self, shutdown), fields(agent_id = %self.identity.agent_id))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            tenant = %self.tenant_slug,
            interval_secs = self.poll_interval.as_secs(),
            "Starting agent loop"
        );

        self.register().await;

        let mut consecutive_failures = 0u32;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(jobs) => {
                            consecutive_failures = 0;
                            debug!(jobs, "Tick complete");
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures <= 3 {
                                warn!(error = %e, consecutive_failures, "Agent tick failed");
                            } else {
                                error!(error = %e, consecutive_failures, "Agent tick failed repeatedly");
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Agent loop shutting down");
                        break;
                    }
                }
            }
        }

        self.phase = Phase::Stopped;
        Ok(())
    }
}
