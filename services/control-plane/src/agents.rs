//! Agent directory: the latest register/heartbeat snapshot of every agent.

use std::sync::Arc;

use chrono::Utc;
use fleet_protocol::{HeartbeatRequest, RegisterRequest, TenantAgent};
use serde_json::json;

use crate::db::{fields, Fields, Store, StoreError, TENANT_AGENTS};

#[derive(Clone)]
pub struct AgentDirectory {
    store: Arc<dyn Store>,
}

impl AgentDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records the agent's registration details. Metrics from earlier
    /// heartbeats are kept.
    pub async fn record_registration(
        &self,
        request: &RegisterRequest,
    ) -> Result<TenantAgent, StoreError> {
        let data = fields([
            ("agent_id", json!(request.agent_id)),
            ("tenant_slug", json!(request.tenant_slug)),
            ("hostname", json!(request.hostname)),
            ("ip", json!(request.local_ip)),
            ("last_seen", json!(Utc::now())),
        ]);
        self.save(&request.agent_id, data).await
    }

    /// Records metrics and `last_seen`. Registration details are kept, and an
    /// agent that heartbeats before registering still gets a snapshot.
    pub async fn record_heartbeat(
        &self,
        request: &HeartbeatRequest,
    ) -> Result<TenantAgent, StoreError> {
        let data = fields([
            ("agent_id", json!(request.agent_id)),
            ("metrics", json!(request.metrics)),
            ("last_seen", json!(Utc::now())),
        ]);
        self.save(&request.agent_id, data).await
    }

    pub async fn find(&self, agent_id: &str) -> Result<Option<TenantAgent>, StoreError> {
        self.store
            .find(TENANT_AGENTS, agent_id)
            .await?
            .map(|r| r.decode())
            .transpose()
    }

    /// Single merging write; concurrent register and heartbeat calls never
    /// drop each other's fields.
    async fn save(&self, agent_id: &str, data: Fields) -> Result<TenantAgent, StoreError> {
        self.store.upsert(TENANT_AGENTS, agent_id, data).await?.decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use fleet_protocol::HostMetrics;

    #[tokio::test]
    async fn test_heartbeat_keeps_registration_details() {
        let directory = AgentDirectory::new(Arc::new(MemoryStore::new()));
        directory
            .record_registration(&RegisterRequest {
                agent_id: "agent-web1-0a1b2c3d".to_string(),
                hostname: "web1".to_string(),
                local_ip: "10.0.0.5".to_string(),
                tenant_slug: Some("acme".to_string()),
                version: None,
            })
            .await
            .unwrap();

        directory
            .record_heartbeat(&HeartbeatRequest {
                agent_id: "agent-web1-0a1b2c3d".to_string(),
                metrics: HostMetrics {
                    load_1m: Some(0.5),
                    free_mem_kb: Some(1024),
                    ..Default::default()
                },
                timestamp: 1_700_000_000,
            })
            .await
            .unwrap();

        let snapshot = directory.find("agent-web1-0a1b2c3d").await.unwrap().unwrap();
        assert_eq!(snapshot.tenant_slug.as_deref(), Some("acme"));
        assert_eq!(snapshot.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(snapshot.metrics.unwrap().free_mem_kb, Some(1024));
    }

    #[tokio::test]
    async fn test_heartbeat_without_registration() {
        let directory = AgentDirectory::new(Arc::new(MemoryStore::new()));
        directory
            .record_heartbeat(&HeartbeatRequest {
                agent_id: "agent-x".to_string(),
                metrics: HostMetrics::default(),
                timestamp: 0,
            })
            .await
            .unwrap();
        let snapshot = directory.find("agent-x").await.unwrap().unwrap();
        assert!(snapshot.hostname.is_none());
        assert!(snapshot.metrics.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_register_and_heartbeat_keep_both() {
        let directory = AgentDirectory::new(Arc::new(MemoryStore::new()));

        for i in 0..20 {
            let agent_id = format!("agent-web{i}-00000000");
            let register = RegisterRequest {
                agent_id: agent_id.clone(),
                hostname: format!("web{i}"),
                local_ip: "10.0.0.5".to_string(),
                tenant_slug: Some("acme".to_string()),
                version: None,
            };
            let heartbeat = HeartbeatRequest {
                agent_id: agent_id.clone(),
                metrics: HostMetrics {
                    uptime_secs: Some(60),
                    ..Default::default()
                },
                timestamp: 1_700_000_000,
            };

            let (a, b) = tokio::join!(
                directory.record_registration(&register),
                directory.record_heartbeat(&heartbeat),
            );
            a.unwrap();
            b.unwrap();

            let snapshot = directory.find(&agent_id).await.unwrap().unwrap();
            assert_eq!(snapshot.hostname, Some(format!("web{i}")));
            assert_eq!(snapshot.metrics.and_then(|m| m.uptime_secs), Some(60));
        }
    }
}
