//! Test doubles for the agent's host-facing seams.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::artifact::ArtifactSource;
use crate::host::{self, CommandOutput, HostError, ServiceHost};

/// Serves canned bodies by URL; unknown URLs fail like a 404.
#[derive(Default)]
pub struct FakeArtifacts {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeArtifacts {
    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn forget(&self, url: &str) {
        self.bodies.lock().unwrap().remove(url);
    }

    fn body(&self, url: &str) -> Result<Vec<u8>> {
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("GET {url} returned 404 Not Found"))
    }
}

#[async_trait]
impl ArtifactSource for FakeArtifacts {
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64> {
        let body = self.body(url)?;
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.body(url)
    }
}

/// Counts service operations; shell commands really run.
#[derive(Default)]
pub struct FakeHost {
    pub fail_smoke: bool,
    pub fail_migrations: bool,
    pub restart_count: AtomicUsize,
    pub migration_count: AtomicUsize,
    pub check_count: AtomicUsize,
}

impl FakeHost {
    pub fn failing_smoke() -> Self {
        Self {
            fail_smoke: true,
            ..Self::default()
        }
    }

    pub fn restarts(&self) -> usize {
        self.restart_count.load(Ordering::SeqCst)
    }

    pub fn migrations(&self) -> usize {
        self.migration_count.load(Ordering::SeqCst)
    }

    pub fn smoke_checks(&self) -> usize {
        self.check_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceHost for FakeHost {
    async fn run_shell(&self, command: &str, timeout: Duration) -> Result<CommandOutput, HostError> {
        host::spawn_shell(command, None, timeout).await
    }

    async fn restart_service(&self) -> Result<(), HostError> {
        self.restart_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), HostError> {
        self.migration_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_migrations {
            return Err(HostError::Failed {
                command: "migrate".to_string(),
                exit_code: Some(1),
                output: "relation already exists".to_string(),
            });
        }
        Ok(())
    }

    async fn smoke_check(&self) -> Result<(), HostError> {
        self.check_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_smoke {
            return Err(HostError::Smoke("503 Service Unavailable".to_string()));
        }
        Ok(())
    }
}

/// Writes a gzipped tarball holding `files`.
pub fn write_bundle(path: &Path, files: &[(&str, &str)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}
