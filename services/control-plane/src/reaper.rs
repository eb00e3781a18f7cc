//! Periodic lease reaper.
//!
//! Claims also reclaim expired leases, but a tenant whose agent died never
//! claims again; this worker keeps its jobs moving.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::jobs::JobQueue;

#[derive(Debug, Clone)]
pub struct LeaseReaperConfig {
    pub interval: Duration,
}

impl Default for LeaseReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

pub struct LeaseReaper {
    jobs: JobQueue,
    config: LeaseReaperConfig,
}

impl LeaseReaper {
    pub fn new(jobs: JobQueue, config: LeaseReaperConfig) -> Self {
        Self { jobs, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            lease_secs = self.jobs.config().lease.as_secs(),
            max_attempts = self.jobs.config().max_attempts,
            "Starting lease reaper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reap_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Lease reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass; errors are logged and retried on the next tick.
    pub async fn reap_once(&self) -> usize {
        match self.jobs.reclaim_expired().await {
            Ok(count) => {
                if count > 0 {
                    info!(reclaimed = count, "Reclaimed expired leases");
                }
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to reclaim expired leases");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::jobs::QueueConfig;
    use fleet_protocol::{JobSpec, JobStatus, RunCommand};
    use std::sync::Arc;

    #[test]
    fn test_config_defaults() {
        let config = LeaseReaperConfig::default();
        assert_eq!(config.interval.as_secs(), 60);
    }

    #[tokio::test]
    async fn test_reaper_returns_expired_job_to_pending() {
        let jobs = JobQueue::new(
            Arc::new(MemoryStore::new()),
            QueueConfig {
                lease: Duration::from_millis(5),
                ..Default::default()
            },
        );
        let job = jobs
            .enqueue(
                "acme",
                JobSpec::RunCommand(RunCommand {
                    command: "true".to_string(),
                    timeout_secs: None,
                }),
            )
            .await
            .unwrap();
        jobs.claim_next("agent-a", "acme", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reaper = LeaseReaper::new(jobs.clone(), LeaseReaperConfig::default());
        assert_eq!(reaper.reap_once().await, 1);
        assert_eq!(
            jobs.find(&job.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_reaper_stops_on_shutdown() {
        let jobs = JobQueue::new(Arc::new(MemoryStore::new()), QueueConfig::default());
        let reaper = LeaseReaper::new(
            jobs,
            LeaseReaperConfig {
                interval: Duration::from_millis(10),
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { reaper.run(rx).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
