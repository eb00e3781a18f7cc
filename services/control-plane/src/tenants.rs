//! Tenant registry.

use std::sync::Arc;

use fleet_id::TenantId;
use fleet_protocol::Tenant;
use serde_json::json;

use crate::db::{fields, Fields, Filter, Store, StoreError, TENANTS};

/// Durable record of provisioned tenants.
#[derive(Clone)]
pub struct TenantRegistry {
    store: Arc<dyn Store>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records a tenant. Fails with `Conflict` when the slug is taken.
    pub async fn create(
        &self,
        slug: &str,
        ip: &str,
        provider_instance_id: &str,
        plan: &str,
    ) -> Result<Tenant, StoreError> {
        let id = TenantId::new();
        let data = fields([
            ("slug", json!(slug)),
            ("ip", json!(ip)),
            ("provider_instance_id", json!(provider_instance_id)),
            ("plan", json!(plan)),
        ]);
        let record = self.store.create(TENANTS, &id.to_string(), data).await?;
        record.decode()
    }

    pub async fn find(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        self.store
            .find(TENANTS, &id.to_string())
            .await?
            .map(|r| r.decode())
            .transpose()
    }

    pub async fn find_by_slug(&self, slug: &str) -> Result<Option<Tenant>, StoreError> {
        let filter = Filter::new().eq("slug", slug);
        self.store
            .find_where(TENANTS, &filter, Some(1))
            .await?
            .first()
            .map(|r| r.decode())
            .transpose()
    }

    pub async fn find_where(&self, filter: &Filter) -> Result<Vec<Tenant>, StoreError> {
        self.store
            .find_where(TENANTS, filter, None)
            .await?
            .iter()
            .map(|r| r.decode())
            .collect()
    }

    /// Applies a partial update, e.g. a new `plan` or `ip`.
    pub async fn update(&self, id: &TenantId, patch: Fields) -> Result<Tenant, StoreError> {
        self.store
            .update(TENANTS, &id.to_string(), patch)
            .await?
            .decode()
    }

    pub async fn delete(&self, id: &TenantId) -> Result<bool, StoreError> {
        self.store.delete(TENANTS, &id.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn registry() -> TenantRegistry {
        TenantRegistry::new(Arc::new(MemoryStore::new().with_unique_key(TENANTS, "slug")))
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let tenants = registry();
        let tenant = tenants
            .create("acme", "10.0.0.5", "i-123", "standard")
            .await
            .unwrap();

        assert_eq!(tenant.slug, "acme");
        assert_eq!(tenants.find(&tenant.id).await.unwrap(), Some(tenant.clone()));
        assert_eq!(
            tenants.find_by_slug("acme").await.unwrap().map(|t| t.id),
            Some(tenant.id)
        );
        assert!(tenants.find_by_slug("globex").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_slug_conflicts() {
        let tenants = registry();
        tenants.create("acme", "10.0.0.5", "i-1", "standard").await.unwrap();
        let err = tenants
            .create("acme", "10.0.0.6", "i-2", "standard")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_plan() {
        let tenants = registry();
        let tenant = tenants.create("acme", "10.0.0.5", "i-1", "standard").await.unwrap();
        let updated = tenants
            .update(&tenant.id, fields([("plan", json!("large"))]))
            .await
            .unwrap();
        assert_eq!(updated.plan, "large");
        assert!(updated.updated_at >= tenant.updated_at);

        let by_plan = tenants
            .find_where(&Filter::new().eq("plan", "large"))
            .await
            .unwrap();
        assert_eq!(by_plan.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_tenant() {
        let tenants = registry();
        let err = tenants
            .update(&TenantId::new(), fields([("plan", json!("large"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
