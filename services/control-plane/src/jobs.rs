//! Job queue.
//!
//! Jobs move `pending → claimed → complete | failed`. Every transition is a
//! compare-and-set against the expected current state, so a late or
//! duplicated report can never overwrite a terminal job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_id::{JobId, RolloutId};
use fleet_protocol::{FailureReason, Job, JobSpec, JobStatus};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::{fields, ClaimRequest, Filter, InFlightCap, Store, StoreError, JOBS};

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a claim stays valid before the job is handed out again.
    pub lease: Duration,

    /// Claims (original plus reclaims) before an expiring job is failed.
    pub max_attempts: u32,

    /// Jobs of one tenant allowed in the claimed state at once.
    /// `None` means unlimited.
    pub max_in_flight_per_tenant: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30 * 60),
            max_attempts: 3,
            max_in_flight_per_tenant: Some(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {job_id} is {from}, cannot move to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// The job is claimed by another agent; the reporter lost ownership.
    #[error("job {job_id} is claimed by {}", .claimed_by.as_deref().unwrap_or("nobody"))]
    ClaimConflict {
        job_id: String,
        claimed_by: Option<String>,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// How a claimed job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Complete(Value),
    Failed(String),
}

impl JobOutcome {
    fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Complete(_) => JobStatus::Complete,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }

    fn result(&self) -> Value {
        match self {
            JobOutcome::Complete(result) => result.clone(),
            JobOutcome::Failed(error) => json!({ "error": error }),
        }
    }
}

/// Durable queue of jobs, built on a [`Store`].
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn Store>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Adds a pending job for the tenant.
    pub async fn enqueue(&self, tenant_slug: &str, spec: JobSpec) -> Result<Job, QueueError> {
        self.insert(tenant_slug, spec, None).await
    }

    /// Adds a pending job tagged with the rollout that created it.
    pub async fn enqueue_for_rollout(
        &self,
        tenant_slug: &str,
        spec: JobSpec,
        rollout_id: RolloutId,
    ) -> Result<Job, QueueError> {
        self.insert(tenant_slug, spec, Some(rollout_id)).await
    }

    async fn insert(
        &self,
        tenant_slug: &str,
        spec: JobSpec,
        rollout_id: Option<RolloutId>,
    ) -> Result<Job, QueueError> {
        let id = JobId::new();
        let data = fields([
            ("tenant_slug", json!(tenant_slug)),
            ("job_type", json!(spec.job_type())),
            ("payload", spec.payload()),
            ("status", json!(JobStatus::Pending)),
            ("result", json!({})),
            ("attempts", json!(0)),
            ("rollout_id", json!(rollout_id)),
        ]);

        let job: Job = self.store.create(JOBS, &id.to_string(), data).await?.decode()?;
        info!(job_id = %job.id, tenant = %tenant_slug, job_type = %job.job_type, "Enqueued job");
        Ok(job)
    }

    /// Claims up to `limit` pending jobs of the tenant for `agent_id`.
    ///
    /// Expired leases are reclaimed first. The claim itself is one atomic
    /// store step, so concurrent callers never receive the same job.
    pub async fn claim_next(
        &self,
        agent_id: &str,
        tenant_slug: &str,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.reclaim_expired().await?;

        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let lease_expires_at = now
            + chrono::Duration::from_std(self.config.lease)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));

        let request = ClaimRequest {
            filter: Filter::new()
                .eq("tenant_slug", tenant_slug)
                .eq("status", JobStatus::Pending.as_str()),
            patch: fields([
                ("status", json!(JobStatus::Claimed)),
                ("claimed_by", json!(agent_id)),
                ("claimed_at", json!(now)),
                ("lease_expires_at", json!(lease_expires_at)),
            ]),
            limit,
            in_flight: self.config.max_in_flight_per_tenant.map(|max| InFlightCap {
                scope: format!("{JOBS}:{tenant_slug}"),
                filter: Filter::new()
                    .eq("tenant_slug", tenant_slug)
                    .eq("status", JobStatus::Claimed.as_str()),
                max,
            }),
        };

        let jobs: Vec<Job> = self
            .store
            .claim(JOBS, &request)
            .await?
            .iter()
            .map(|r| r.decode())
            .collect::<Result<_, _>>()?;

        if !jobs.is_empty() {
            info!(agent_id = %agent_id, tenant = %tenant_slug, count = jobs.len(), "Claimed jobs");
        }
        Ok(jobs)
    }

    pub async fn complete(&self, job_id: &JobId, result: Value) -> Result<Job, QueueError> {
        self.report(job_id, None, JobOutcome::Complete(result)).await
    }

    pub async fn fail(&self, job_id: &JobId, error: &str) -> Result<Job, QueueError> {
        self.report(job_id, None, JobOutcome::Failed(error.to_string()))
            .await
    }

    /// Moves a claimed job to its terminal status.
    ///
    /// With `agent_id`, the job must be claimed by that agent. Reporting on a
    /// job that is already terminal returns it unchanged.
    pub async fn report(
        &self,
        job_id: &JobId,
        agent_id: Option<&str>,
        outcome: JobOutcome,
    ) -> Result<Job, QueueError> {
        let id = job_id.to_string();

        let mut expected = Filter::new().eq("status", JobStatus::Claimed.as_str());
        if let Some(agent_id) = agent_id {
            expected = expected.eq("claimed_by", agent_id);
        }
        let patch = fields([
            ("status", json!(outcome.status())),
            ("result", outcome.result()),
            ("lease_expires_at", Value::Null),
        ]);

        if let Some(record) = self.store.compare_and_set(JOBS, &id, &expected, patch).await? {
            let job: Job = record.decode()?;
            info!(job_id = %job.id, status = %job.status, "Job finished");
            return Ok(job);
        }

        let job = self
            .find(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        match job.status {
            status if status.is_terminal() => {
                debug!(job_id = %id, status = %status, "Ignoring report for finished job");
                Ok(job)
            }
            JobStatus::Pending => Err(QueueError::InvalidTransition {
                job_id: id,
                from: JobStatus::Pending,
                to: outcome.status(),
            }),
            _ => Err(QueueError::ClaimConflict {
                job_id: id,
                claimed_by: job.claimed_by,
            }),
        }
    }

    /// Returns expired claims to `pending`, or fails them once they have used
    /// up `max_attempts`. Returns how many jobs were touched.
    pub async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let expired = self
            .store
            .find_where(
                JOBS,
                &Filter::new()
                    .eq("status", JobStatus::Claimed.as_str())
                    .before("lease_expires_at", now),
                None,
            )
            .await?;

        let mut reclaimed = 0;
        for record in expired {
            let job: Job = record.decode()?;
            let attempts = job.attempts + 1;

            let expected = Filter::new()
                .eq("status", JobStatus::Claimed.as_str())
                .eq("claimed_by", job.claimed_by.clone())
                .before("lease_expires_at", now);

            let patch = if attempts >= self.config.max_attempts {
                fields([
                    ("status", json!(JobStatus::Failed)),
                    ("result", json!({ "error": FailureReason::LeaseExpired.as_str() })),
                    ("attempts", json!(attempts)),
                    ("lease_expires_at", Value::Null),
                ])
            } else {
                fields([
                    ("status", json!(JobStatus::Pending)),
                    ("claimed_by", Value::Null),
                    ("claimed_at", Value::Null),
                    ("lease_expires_at", Value::Null),
                    ("attempts", json!(attempts)),
                ])
            };

            if self
                .store
                .compare_and_set(JOBS, &record.id, &expected, patch)
                .await?
                .is_some()
            {
                reclaimed += 1;
                warn!(
                    job_id = %job.id,
                    agent_id = job.claimed_by.as_deref().unwrap_or(""),
                    attempts,
                    failed = attempts >= self.config.max_attempts,
                    "Reclaimed expired job lease"
                );
            }
        }

        Ok(reclaimed)
    }

    pub async fn find(&self, job_id: &JobId) -> Result<Option<Job>, QueueError> {
        Ok(self
            .store
            .find(JOBS, &job_id.to_string())
            .await?
            .map(|r| r.decode())
            .transpose()?)
    }

    /// Jobs of a tenant, oldest first, optionally narrowed to one status.
    pub async fn list(
        &self,
        tenant_slug: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, QueueError> {
        let mut filter = Filter::new().eq("tenant_slug", tenant_slug);
        if let Some(status) = status {
            filter = filter.eq("status", status.as_str());
        }
        self.find_jobs(&filter).await
    }

    /// Jobs created by one rollout, optionally narrowed to one status.
    pub async fn list_for_rollout(
        &self,
        rollout_id: &RolloutId,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, QueueError> {
        let mut filter = Filter::new().eq("rollout_id", rollout_id.to_string());
        if let Some(status) = status {
            filter = filter.eq("status", status.as_str());
        }
        self.find_jobs(&filter).await
    }

    async fn find_jobs(&self, filter: &Filter) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .store
            .find_where(JOBS, filter, None)
            .await?
            .iter()
            .map(|r| r.decode())
            .collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use fleet_protocol::{DeployBundle, RunCommand};
    use std::collections::HashSet;

    fn queue(config: QueueConfig) -> JobQueue {
        JobQueue::new(Arc::new(MemoryStore::new()), config)
    }

    fn unlimited() -> QueueConfig {
        QueueConfig {
            max_in_flight_per_tenant: None,
            ..Default::default()
        }
    }

    fn command(cmd: &str) -> JobSpec {
        JobSpec::RunCommand(RunCommand {
            command: cmd.to_string(),
            timeout_secs: None,
        })
    }

    #[tokio::test]
    async fn test_enqueue_is_pending() {
        let q = queue(QueueConfig::default());
        let job = q
            .enqueue(
                "acme",
                JobSpec::DeployBundle(DeployBundle {
                    artifact_url: "https://cdn/a.tgz".to_string(),
                    signature_url: "https://cdn/a.sig".to_string(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.payload["artifact_url"], "https://cdn/a.tgz");
        assert!(job.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_claim_sets_lease_and_owner() {
        let q = queue(unlimited());
        let job = q.enqueue("acme", command("uptime")).await.unwrap();

        let claimed = q.claim_next("agent-a", "acme", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let claimed = &claimed[0];
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("agent-a"));
        assert!(claimed.lease_expires_at.unwrap() > Utc::now());

        assert!(q.claim_next("agent-b", "acme", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_only_own_tenant() {
        let q = queue(unlimited());
        q.enqueue("globex", command("uptime")).await.unwrap();
        assert!(q.claim_next("agent-a", "acme", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_out_each_job_once() {
        let q = queue(unlimited());
        for i in 0..10 {
            q.enqueue("acme", command(&format!("echo {i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for n in 0..8 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                q.claim_next(&format!("agent-{n}"), "acme", 10).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for job in handle.await.unwrap() {
                assert!(seen.insert(job.id), "job {} handed out twice", job.id);
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn test_claim_respects_in_flight_cap() {
        let q = queue(QueueConfig {
            max_in_flight_per_tenant: Some(2),
            ..Default::default()
        });
        for i in 0..5 {
            q.enqueue("acme", command(&format!("echo {i}"))).await.unwrap();
        }

        let first = q.claim_next("agent-a", "acme", 10).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(q.claim_next("agent-a", "acme", 10).await.unwrap().is_empty());

        q.complete(&first[0].id, json!({"ok": true})).await.unwrap();
        assert_eq!(q.claim_next("agent-a", "acme", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_then_duplicate_report_is_noop() {
        let q = queue(unlimited());
        let job = q.enqueue("acme", command("uptime")).await.unwrap();
        q.claim_next("agent-a", "acme", 1).await.unwrap();

        let done = q.complete(&job.id, json!({"output": "up"})).await.unwrap();
        assert_eq!(done.status, JobStatus::Complete);

        let again = q.fail(&job.id, "smoke_test_failed").await.unwrap();
        assert_eq!(again.status, JobStatus::Complete);
        assert_eq!(again.result, json!({"output": "up"}));
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let q = queue(unlimited());
        let job = q.enqueue("acme", command("uptime")).await.unwrap();
        q.claim_next("agent-a", "acme", 1).await.unwrap();

        let failed = q.fail(&job.id, "download_failed").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error(), Some("download_failed"));
    }

    #[tokio::test]
    async fn test_report_on_pending_is_invalid() {
        let q = queue(unlimited());
        let job = q.enqueue("acme", command("uptime")).await.unwrap();
        let err = q.complete(&job.id, json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { from: JobStatus::Pending, .. }));
    }

    #[tokio::test]
    async fn test_report_by_other_agent_conflicts() {
        let q = queue(unlimited());
        let job = q.enqueue("acme", command("uptime")).await.unwrap();
        q.claim_next("agent-a", "acme", 1).await.unwrap();

        let err = q
            .report(&job.id, Some("agent-b"), JobOutcome::Complete(json!({})))
            .await
            .unwrap_err();
        assert!(
            matches!(err, QueueError::ClaimConflict { ref claimed_by, .. } if claimed_by.as_deref() == Some("agent-a"))
        );

        let ok = q
            .report(&job.id, Some("agent-a"), JobOutcome::Complete(json!({})))
            .await
            .unwrap();
        assert_eq!(ok.status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_report_unknown_job() {
        let q = queue(unlimited());
        let err = q.complete(&JobId::new(), json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_then_failed() {
        let q = queue(QueueConfig {
            lease: Duration::from_millis(10),
            max_attempts: 2,
            max_in_flight_per_tenant: None,
        });
        let job = q.enqueue("acme", command("uptime")).await.unwrap();

        let first = q.claim_next("agent-a", "acme", 1).await.unwrap();
        assert_eq!(first.len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The next claim reclaims the expired lease and hands the job out again.
        let second = q.claim_next("agent-b", "acme", 1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempts, 1);
        assert_eq!(second[0].claimed_by.as_deref(), Some("agent-b"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(q.reclaim_expired().await.unwrap(), 1);

        let failed = q.find(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error(), Some("lease_expired"));
        assert_eq!(failed.attempts, 2);
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let q = queue(unlimited());
        q.enqueue("acme", command("a")).await.unwrap();
        let b = q.enqueue("acme", command("b")).await.unwrap();
        q.enqueue("globex", command("c")).await.unwrap();

        q.claim_next("agent-a", "acme", 2).await.unwrap();
        q.fail(&b.id, "command_timed_out").await.unwrap();

        assert_eq!(q.list("acme", None).await.unwrap().len(), 2);
        let failed = q.list("acme", Some(JobStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, b.id);
    }
}
