//! Rollout log: durable progress of every staged rollout.
//!
//! A rollout is recorded as `running` before its first batch and updated after
//! every batch, so a client can see how far it got even if the control plane
//! stops halfway through.

use std::sync::Arc;

use fleet_id::RolloutId;
use fleet_protocol::{Rollout, RolloutStatus};
use serde_json::json;
use tracing::warn;

use crate::db::{fields, Filter, Store, StoreError, ROLLOUTS};
use crate::deployer::RolloutPlan;

#[derive(Clone)]
pub struct RolloutLog {
    store: Arc<dyn Store>,
}

impl RolloutLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records a rollout that is about to create its first batch.
    pub async fn start(&self, id: RolloutId, plan: &RolloutPlan) -> Result<Rollout, StoreError> {
        let data = fields([
            ("artifact_url", json!(plan.artifact_url)),
            ("signature_url", json!(plan.signature_url)),
            ("tag", json!(plan.tag)),
            ("tenant_slugs", json!(plan.tenant_slugs)),
            ("batch_size", json!(plan.batch_size)),
            ("pause_secs", json!(plan.pause.as_secs())),
            ("halt_on_failure", json!(plan.halt_on_failure)),
            ("status", json!(RolloutStatus::Running)),
            ("created", json!(0)),
            ("batches", json!(0)),
        ]);
        self.store
            .create(ROLLOUTS, &id.to_string(), data)
            .await?
            .decode()
    }

    pub async fn record_progress(
        &self,
        id: &RolloutId,
        created: usize,
        batches: usize,
    ) -> Result<Rollout, StoreError> {
        let patch = fields([("created", json!(created)), ("batches", json!(batches))]);
        self.store
            .update(ROLLOUTS, &id.to_string(), patch)
            .await?
            .decode()
    }

    /// Moves a running rollout to its final status. A rollout that already
    /// finished is left alone and `None` is returned.
    pub async fn finish(
        &self,
        id: &RolloutId,
        status: RolloutStatus,
        created: usize,
        batches: usize,
    ) -> Result<Option<Rollout>, StoreError> {
        let expected = Filter::new().eq("status", RolloutStatus::Running.as_str());
        let patch = fields([
            ("status", json!(status)),
            ("created", json!(created)),
            ("batches", json!(batches)),
        ]);
        self.store
            .compare_and_set(ROLLOUTS, &id.to_string(), &expected, patch)
            .await?
            .map(|r| r.decode())
            .transpose()
    }

    pub async fn find(&self, id: &RolloutId) -> Result<Option<Rollout>, StoreError> {
        self.store
            .find(ROLLOUTS, &id.to_string())
            .await?
            .map(|r| r.decode())
            .transpose()
    }

    /// Marks rollouts left `running` by a previous process as interrupted.
    ///
    /// Run once at startup, before any new rollout is spawned.
    pub async fn interrupt_stale(&self) -> Result<Vec<Rollout>, StoreError> {
        let running = Filter::new().eq("status", RolloutStatus::Running.as_str());
        let mut interrupted = Vec::new();
        for record in self.store.find_where(ROLLOUTS, &running, None).await? {
            let stale: Rollout = record.decode()?;
            if let Some(rollout) = self
                .finish(&stale.id, RolloutStatus::Interrupted, stale.created, stale.batches)
                .await?
            {
                warn!(
                    rollout_id = %rollout.id,
                    created = rollout.created,
                    remaining = rollout.remaining(),
                    "Rollout was cut short by a restart; remaining batches were never scheduled"
                );
                interrupted.push(rollout);
            }
        }
        Ok(interrupted)
    }
}
