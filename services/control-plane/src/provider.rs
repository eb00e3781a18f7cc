//! Compute instance provider seam.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("instance {0} not found")]
    NotFound(String),
}

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub image: String,
    /// Provider size class; the tenant's plan.
    pub flavor: String,
    pub ssh_keys: Vec<String>,
}

/// A created instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub ip: String,
}

/// Creates and manages compute instances on some cloud.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn create(&self, request: &InstanceRequest) -> Result<Instance, ProviderError>;

    async fn delete(&self, instance_id: &str) -> Result<(), ProviderError>;

    async fn reboot(&self, instance_id: &str) -> Result<(), ProviderError>;
}

/// In-process provider that hands out sequential ids and private IPs.
///
/// Used in dev mode and tests; `fail_next_create` makes the next create fail.
#[derive(Debug, Default)]
pub struct MockProvider {
    next: AtomicU32,
    reboots: AtomicU32,
    instances: Mutex<HashMap<String, InstanceRequest>>,
    fail_next_create: Mutex<Option<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create(&self, reason: &str) {
        if let Ok(mut slot) = self.fail_next_create.lock() {
            *slot = Some(reason.to_string());
        }
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.instances.lock().map(|i| i.len()).unwrap_or(0)
    }

    /// Total create calls that succeeded, including deleted instances.
    pub fn created(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }

    /// Reboot calls that hit a live instance.
    pub fn rebooted(&self) -> u32 {
        self.reboots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceProvider for MockProvider {
    async fn create(&self, request: &InstanceRequest) -> Result<Instance, ProviderError> {
        let failure = self
            .fail_next_create
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(reason) = failure {
            return Err(ProviderError::Rejected(reason));
        }

        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = Instance {
            id: format!("mock-{n:04}"),
            ip: format!("10.0.{}.{}", n / 250, n % 250 + 2),
        };
        if let Ok(mut instances) = self.instances.lock() {
            instances.insert(instance.id.clone(), request.clone());
        }
        info!(instance_id = %instance.id, name = %request.name, "Created mock instance");
        Ok(instance)
    }

    async fn delete(&self, instance_id: &str) -> Result<(), ProviderError> {
        let removed = self
            .instances
            .lock()
            .map(|mut i| i.remove(instance_id).is_some())
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(ProviderError::NotFound(instance_id.to_string()))
        }
    }

    async fn reboot(&self, instance_id: &str) -> Result<(), ProviderError> {
        let known = self
            .instances
            .lock()
            .map(|i| i.contains_key(instance_id))
            .unwrap_or(false);
        if known {
            self.reboots.fetch_add(1, Ordering::SeqCst);
            info!(instance_id, "Rebooted mock instance");
            Ok(())
        } else {
            Err(ProviderError::NotFound(instance_id.to_string()))
        }
    }
}
