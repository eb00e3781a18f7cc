//! Tenant provisioning and staged rollouts.
//!
//! Rollouts run on background tasks owned by the [`Deployer`]. Their progress
//! is written to the [`RolloutLog`] after every batch, and
//! [`Deployer::shutdown_rollouts`] stops them at their next pause so an
//! interrupted rollout is recorded as such instead of vanishing.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::RolloutId;
use fleet_protocol::{DeployBundle, JobSpec, JobStatus, Rollout, RolloutStatus, Tenant};
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::db::{Filter, StoreError};
use crate::jobs::{JobQueue, QueueError};
use crate::provider::{InstanceProvider, InstanceRequest, ProviderError};
use crate::rollouts::RolloutLog;
use crate::tenants::TenantRegistry;

const MAX_SLUG_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The provider failed to create the instance. Never retried here.
    #[error("instance provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("tenant {0} already exists")]
    DuplicateSlug(String),

    #[error("invalid slug {slug:?}: {reason}")]
    InvalidSlug { slug: String, reason: &'static str },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RebootError {
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("instance provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid rollout plan: {0}")]
    InvalidPlan(String),

    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("control plane is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Instance naming and image for new tenants, and the release rollout policy.
#[derive(Debug, Clone)]
pub struct DeployerConfig {
    pub base_image: String,
    pub instance_prefix: String,
    /// Batch size of rollouts started by the CI webhook.
    pub release_batch_size: usize,
    /// Pause between batches of rollouts started by the CI webhook.
    pub release_pause: Duration,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            base_image: "ubuntu-22.04".to_string(),
            instance_prefix: "fleet".to_string(),
            release_batch_size: 5,
            release_pause: Duration::from_secs(600),
        }
    }
}

/// A staged rollout of one signed artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutPlan {
    pub artifact_url: String,
    pub signature_url: String,
    pub tag: Option<String>,
    pub tenant_slugs: Vec<String>,
    pub batch_size: usize,
    /// Sleep between two batches.
    pub pause: Duration,
    /// Stop creating batches once any job of the rollout has failed.
    pub halt_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RolloutSummary {
    pub rollout_id: RolloutId,
    pub status: RolloutStatus,
    /// Jobs actually created.
    pub count: usize,
    /// Batches actually created.
    pub batches: usize,
}

/// A rollout running on a background task.
pub struct RolloutHandle {
    pub rollout_id: RolloutId,
    /// Jobs the plan will create if it runs to the end.
    pub planned: usize,
    /// Resolves when the task ends. Dropping it does not cancel the rollout.
    pub done: oneshot::Receiver<Result<RolloutSummary, RolloutError>>,
}

/// Background rollout tasks and the signal that stops them.
struct RolloutTasks {
    stop: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

#[derive(Debug, Default)]
struct Progress {
    count: usize,
    batches: usize,
}

/// Checks that a slug can name both a tenant and an instance.
pub fn validate_slug(slug: &str) -> Result<(), ProvisionError> {
    let invalid = |reason| ProvisionError::InvalidSlug {
        slug: slug.to_string(),
        reason,
    };

    if slug.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(invalid("must be at most 63 characters"));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("may only contain lowercase letters, digits and '-'"));
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err(invalid("must not start or end with '-'"));
    }
    Ok(())
}

/// Resolves once `stop` flips to true.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let closed = stop.wait_for(|stopped| *stopped).await.is_err();
    if closed {
        // The sender lives in the deployer, which outlives every rollout.
        std::future::pending::<()>().await;
    }
}

#[derive(Clone)]
pub struct Deployer {
    tenants: TenantRegistry,
    jobs: JobQueue,
    rollouts: RolloutLog,
    provider: Arc<dyn InstanceProvider>,
    config: DeployerConfig,
    running: Arc<RolloutTasks>,
}

impl Deployer {
    pub fn new(
        tenants: TenantRegistry,
        jobs: JobQueue,
        rollouts: RolloutLog,
        provider: Arc<dyn InstanceProvider>,
        config: DeployerConfig,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            tenants,
            jobs,
            rollouts,
            provider,
            config,
            running: Arc::new(RolloutTasks {
                stop,
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Creates an instance for `slug` and records the tenant.
    ///
    /// A taken slug is rejected before the provider is called.
    #[instrument(skip(self, ssh_keys))]
    pub async fn provision_tenant(
        &self,
        slug: &str,
        plan: &str,
        ssh_keys: &[String],
    ) -> Result<Tenant, ProvisionError> {
        validate_slug(slug)?;

        if self.tenants.find_by_slug(slug).await?.is_some() {
            return Err(ProvisionError::DuplicateSlug(slug.to_string()));
        }

        let request = InstanceRequest {
            name: format!("{}-{slug}", self.config.instance_prefix),
            image: self.config.base_image.clone(),
            flavor: plan.to_string(),
            ssh_keys: ssh_keys.to_vec(),
        };
        let instance = self.provider.create(&request).await?;

        match self.tenants.create(slug, &instance.ip, &instance.id, plan).await {
            Ok(tenant) => {
                info!(tenant_id = %tenant.id, ip = %tenant.ip, "Provisioned tenant");
                Ok(tenant)
            }
            Err(err) => {
                // The instance would be orphaned; remove it.
                if let Err(e) = self.provider.delete(&instance.id).await {
                    error!(instance_id = %instance.id, error = %e, "Failed to delete orphaned instance");
                }
                match err {
                    StoreError::Conflict { .. } => {
                        warn!("Lost slug race, deleted new instance");
                        Err(ProvisionError::DuplicateSlug(slug.to_string()))
                    }
                    other => Err(ProvisionError::Storage(other)),
                }
            }
        }
    }

    /// Reboots the tenant's instance through the provider.
    #[instrument(skip(self))]
    pub async fn reboot_tenant(&self, slug: &str) -> Result<Tenant, RebootError> {
        let tenant = self
            .tenants
            .find_by_slug(slug)
            .await?
            .ok_or_else(|| RebootError::UnknownTenant(slug.to_string()))?;
        self.provider.reboot(&tenant.provider_instance_id).await?;
        info!(instance_id = %tenant.provider_instance_id, "Rebooted tenant instance");
        Ok(tenant)
    }

    /// Rejects empty plans, zero batch sizes and unknown tenants.
    pub async fn validate_rollout(&self, plan: &RolloutPlan) -> Result<(), RolloutError> {
        if plan.batch_size == 0 {
            return Err(RolloutError::InvalidPlan("batch_size must be positive".to_string()));
        }
        if plan.tenant_slugs.is_empty() {
            return Err(RolloutError::InvalidPlan("no tenants given".to_string()));
        }
        for slug in &plan.tenant_slugs {
            if self.tenants.find_by_slug(slug).await?.is_none() {
                return Err(RolloutError::UnknownTenant(slug.clone()));
            }
        }
        Ok(())
    }

    /// Validates the plan and runs it to the end, pauses included.
    pub async fn schedule_rollout(&self, plan: RolloutPlan) -> Result<RolloutSummary, RolloutError> {
        self.validate_rollout(&plan).await?;
        let rollout_id = RolloutId::new();
        self.rollouts.start(rollout_id, &plan).await?;
        self.run_rollout(rollout_id, plan).await
    }

    /// Validates and records the plan, then runs it on a background task.
    pub async fn spawn_rollout(&self, plan: RolloutPlan) -> Result<RolloutHandle, RolloutError> {
        self.validate_rollout(&plan).await?;

        // Held until the task is in the set, so shutdown cannot miss it.
        let mut tasks = self.running.tasks.lock().await;
        if *self.running.stop.borrow() {
            return Err(RolloutError::ShuttingDown);
        }
        while tasks.try_join_next().is_some() {}

        let rollout_id = RolloutId::new();
        self.rollouts.start(rollout_id, &plan).await?;

        let planned = plan.tenant_slugs.len();
        let (tx, done) = oneshot::channel();
        let deployer = self.clone();
        tasks.spawn(async move {
            let result = deployer.run_rollout(rollout_id, plan).await;
            if let Err(e) = &result {
                error!(rollout_id = %rollout_id, error = %e, "Rollout failed");
            }
            // Nobody may be waiting; the rollout log has the outcome either way.
            tx.send(result).ok();
        });

        Ok(RolloutHandle {
            rollout_id,
            planned,
            done,
        })
    }

    /// Rolls a freshly built release out to every tenant with the release
    /// policy from [`DeployerConfig`].
    pub async fn spawn_release_rollout(
        &self,
        artifact_url: &str,
        signature_url: &str,
        tag: &str,
    ) -> Result<RolloutHandle, RolloutError> {
        let tenant_slugs = self
            .tenants
            .find_where(&Filter::new())
            .await?
            .into_iter()
            .map(|t| t.slug)
            .collect();

        self.spawn_rollout(RolloutPlan {
            artifact_url: artifact_url.to_string(),
            signature_url: signature_url.to_string(),
            tag: Some(tag.to_string()),
            tenant_slugs,
            batch_size: self.config.release_batch_size,
            pause: self.config.release_pause,
            halt_on_failure: true,
        })
        .await
    }

    pub async fn rollout(&self, rollout_id: &RolloutId) -> Result<Option<Rollout>, StoreError> {
        self.rollouts.find(rollout_id).await
    }

    /// Closes out rollouts a previous process left running. Call before
    /// serving requests.
    pub async fn interrupt_stale_rollouts(&self) -> Result<usize, StoreError> {
        Ok(self.rollouts.interrupt_stale().await?.len())
    }

    /// Stops every running rollout at its next pause and waits up to `grace`
    /// for them to record where they stopped. New rollouts are refused from
    /// here on.
    ///
    /// Returns how many tasks were still running when `grace` ran out. Those
    /// are aborted and stay `running` in the log until the next startup marks
    /// them interrupted.
    pub async fn shutdown_rollouts(&self, grace: Duration) -> usize {
        self.running.stop.send_replace(true);
        let mut tasks = std::mem::take(&mut *self.running.tasks.lock().await);
        if tasks.is_empty() {
            return 0;
        }

        info!(rollouts = tasks.len(), "Stopping running rollouts");
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Rollout task panicked");
                }
            }
        })
        .await;

        if drained.is_ok() {
            return 0;
        }
        let left = tasks.len();
        tasks.abort_all();
        warn!(left, "Aborted rollouts that did not stop in time");
        left
    }

    #[instrument(skip(self, plan), fields(tenants = plan.tenant_slugs.len()))]
    async fn run_rollout(
        &self,
        rollout_id: RolloutId,
        plan: RolloutPlan,
    ) -> Result<RolloutSummary, RolloutError> {
        let mut progress = Progress::default();
        let outcome = self.create_batches(rollout_id, &plan, &mut progress).await;

        let status = match &outcome {
            Ok(status) => *status,
            Err(_) => RolloutStatus::Failed,
        };
        if let Err(e) = self
            .rollouts
            .finish(&rollout_id, status, progress.count, progress.batches)
            .await
        {
            error!(error = %e, %status, "Failed to record rollout outcome");
        }

        let remaining = plan.tenant_slugs.len() - progress.count;
        match status {
            RolloutStatus::Interrupted => warn!(
                count = progress.count,
                remaining,
                "Rollout interrupted by shutdown; remaining batches were not scheduled"
            ),
            _ => info!(
                count = progress.count,
                batches = progress.batches,
                %status,
                "Rollout scheduling finished"
            ),
        }

        outcome.map(|status| RolloutSummary {
            rollout_id,
            status,
            count: progress.count,
            batches: progress.batches,
        })
    }

    async fn create_batches(
        &self,
        rollout_id: RolloutId,
        plan: &RolloutPlan,
        progress: &mut Progress,
    ) -> Result<RolloutStatus, RolloutError> {
        let spec = JobSpec::DeployBundle(DeployBundle {
            artifact_url: plan.artifact_url.clone(),
            signature_url: plan.signature_url.clone(),
        });
        let mut stop = self.running.stop.subscribe();

        for (index, batch) in plan.tenant_slugs.chunks(plan.batch_size).enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(plan.pause) => {}
                    _ = stopped(&mut stop) => return Ok(RolloutStatus::Interrupted),
                }

                if plan.halt_on_failure {
                    let failed = self
                        .jobs
                        .list_for_rollout(&rollout_id, Some(JobStatus::Failed))
                        .await?;
                    if !failed.is_empty() {
                        warn!(failed = failed.len(), created = progress.count, "Halting rollout after failures");
                        return Ok(RolloutStatus::Halted);
                    }
                }
            }

            for slug in batch {
                self.jobs
                    .enqueue_for_rollout(slug, spec.clone(), rollout_id)
                    .await?;
                progress.count += 1;
            }
            progress.batches += 1;
            self.rollouts
                .record_progress(&rollout_id, progress.count, progress.batches)
                .await?;
            info!(batch = index + 1, size = batch.len(), "Scheduled rollout batch");
        }

        Ok(RolloutStatus::Completed)
    }
}
