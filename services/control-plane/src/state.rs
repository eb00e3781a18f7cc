//! Application state shared across request handlers.

use std::sync::Arc;

use crate::agents::AgentDirectory;
use crate::api::auth::AccessTokens;
use crate::db::Store;
use crate::deployer::{Deployer, DeployerConfig};
use crate::jobs::{JobQueue, QueueConfig};
use crate::provider::InstanceProvider;
use crate::rollouts::RolloutLog;
use crate::tenants::TenantRegistry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor. Every
/// component is built on the same store.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn Store>,
    tenants: TenantRegistry,
    jobs: JobQueue,
    agents: AgentDirectory,
    deployer: Deployer,
    tokens: AccessTokens,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn InstanceProvider>,
        tokens: AccessTokens,
        queue: QueueConfig,
        deployer: DeployerConfig,
    ) -> Self {
        let tenants = TenantRegistry::new(store.clone());
        let jobs = JobQueue::new(store.clone(), queue);
        let agents = AgentDirectory::new(store.clone());
        let deployer = Deployer::new(
            tenants.clone(),
            jobs.clone(),
            RolloutLog::new(store.clone()),
            provider,
            deployer,
        );

        Self {
            inner: Arc::new(AppStateInner {
                store,
                tenants,
                jobs,
                agents,
                deployer,
                tokens,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn tenants(&self) -> &TenantRegistry {
        &self.inner.tenants
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.inner.jobs
    }

    pub fn agents(&self) -> &AgentDirectory {
        &self.inner.agents
    }

    pub fn deployer(&self) -> &Deployer {
        &self.inner.deployer
    }

    pub fn tokens(&self) -> &AccessTokens {
        &self.inner.tokens
    }
}
