//! `deploy_bundle`: download, verify, back up, swap, restart, smoke test and
//! roll back on failure.

use std::path::{Path, PathBuf};

use fleet_protocol::{DeployBundle, FailureReason};
use rand::Rng;
use serde_json::json;
use tracing::{error, info, warn};

use super::{JobExecutor, JobOutcome};
use crate::bundle::{self, BundleError, ReleasePaths};

/// Runs a blocking bundle operation on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, BundleError>
where
    F: FnOnce() -> Result<T, BundleError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BundleError::Io(std::io::Error::other(e)))?
}

/// Removes a half-built staging tree. Failures are logged, not returned.
async fn discard_staging(paths: &ReleasePaths) -> bool {
    let staging = paths.staging.clone();
    match blocking(move || bundle::remove_tree(&staging)).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, staging = %paths.staging.display(), "Failed to clean up staging dir");
            false
        }
    }
}

impl JobExecutor {
    pub(super) async fn deploy_bundle(&self, job_id: &str, payload: &DeployBundle) -> JobOutcome {
        if let Err(e) = tokio::fs::create_dir_all(&self.settings.work_dir).await {
            error!(error = %e, work_dir = %self.settings.work_dir.display(), "Cannot create work dir");
            return JobOutcome::Failed(FailureReason::DownloadFailed);
        }

        let suffix: u64 = rand::rng().random();
        let archive = self.settings.work_dir.join(format!("bundle-{suffix:016x}.tgz"));

        let outcome = self.deploy_from(job_id, payload, &archive).await;

        if let Err(e) = tokio::fs::remove_file(&archive).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, archive = %archive.display(), "Failed to remove downloaded archive");
            }
        }
        outcome
    }

    async fn deploy_from(&self, job_id: &str, payload: &DeployBundle, archive: &Path) -> JobOutcome {
        // 1. Download
        if let Err(e) = self.artifacts.fetch_to(&payload.artifact_url, archive).await {
            warn!(error = %e, url = %payload.artifact_url, "Artifact download failed");
            return JobOutcome::Failed(FailureReason::DownloadFailed);
        }

        // 2. Verify
        if !self.verify(payload, archive).await {
            return JobOutcome::Failed(FailureReason::SignatureVerificationFailed);
        }

        let paths = match ReleasePaths::for_live(&self.settings.deploy_dir) {
            Ok(paths) => paths,
            Err(e) => {
                error!(error = %e, "Unusable deploy dir");
                return JobOutcome::Failed(FailureReason::SwapFailed);
            }
        };

        // 3. Backup
        let backup = self.backup(job_id).await;

        // 4. Extract and swap
        let (src, dest) = (archive.to_path_buf(), paths.staging.clone());
        if let Err(e) = blocking(move || bundle::extract_archive(&src, &dest)).await {
            warn!(error = %e, "Extraction failed");
            discard_staging(&paths).await;
            return JobOutcome::Failed(FailureReason::UntarFailed);
        }

        let swap_paths = paths.clone();
        if let Err(e) = blocking(move || bundle::swap(&swap_paths)).await {
            error!(error = %e, "Swap failed");
            discard_staging(&paths).await;
            return JobOutcome::Failed(FailureReason::SwapFailed);
        }

        // 5. Migrations
        if let Err(e) = self.host.run_migrations().await {
            warn!(error = %e, "Migrations failed; continuing");
        }

        // 6. Restart
        if let Err(e) = self.host.restart_service().await {
            warn!(error = %e, "Restart failed");
        }

        // 7. Smoke test
        if self.smoke_test().await {
            let done = paths.clone();
            if let Err(e) = blocking(move || bundle::finish(&done)).await {
                warn!(error = %e, "Failed to remove retired tree");
            }
            info!(backup = ?backup, "Deploy complete");
            return JobOutcome::Complete(json!({
                "ok": true,
                "backup": backup.map(|p| p.display().to_string()),
            }));
        }

        // 8. Roll back
        self.roll_back(&paths, backup).await;
        JobOutcome::Failed(FailureReason::SmokeTestFailed)
    }

    async fn verify(&self, payload: &DeployBundle, archive: &Path) -> bool {
        let Some(verifier) = self.verifier.clone() else {
            error!("No release public key configured; refusing to deploy");
            return false;
        };

        let signature = match self.artifacts.fetch_bytes(&payload.signature_url).await {
            Ok(signature) => signature,
            Err(e) => {
                warn!(error = %e, url = %payload.signature_url, "Signature download failed");
                return false;
            }
        };

        let path = archive.to_path_buf();
        let checked =
            tokio::task::spawn_blocking(move || verifier.verify_file(&path, &signature)).await;
        match checked {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Signature verification failed");
                false
            }
            Err(e) => {
                error!(error = %e, "Signature verification task failed");
                false
            }
        }
    }

    async fn backup(&self, job_id: &str) -> Option<PathBuf> {
        let live = self.settings.deploy_dir.clone();
        let backups_dir = self.settings.backups_dir();
        // Never prune the backup this deploy may roll back to.
        let keep = self.settings.keep_backups.max(1);
        let label = job_id.to_string();

        let result = blocking(move || {
            let saved = bundle::backup(&live, &backups_dir, &label)?;
            bundle::prune_backups(&backups_dir, keep)?;
            Ok(saved)
        })
        .await;

        match result {
            Ok(saved) => saved,
            Err(e) => {
                warn!(error = %e, "Backup failed; continuing without one");
                None
            }
        }
    }

    async fn smoke_test(&self) -> bool {
        let attempts = self.settings.smoke_attempts.max(1);
        for attempt in 1..=attempts {
            match self.host.smoke_check().await {
                Ok(()) => return true,
                Err(e) => warn!(error = %e, attempt, attempts, "Smoke test failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.smoke_delay).await;
            }
        }
        false
    }

    async fn roll_back(&self, paths: &ReleasePaths, backup: Option<PathBuf>) {
        warn!("Rolling back to previous release");
        let restore = paths.clone();
        if let Err(e) = blocking(move || bundle::rollback(&restore, backup.as_deref())).await {
            error!(error = %e, "Rollback failed");
        }
        if let Err(e) = self.host.restart_service().await {
            error!(error = %e, "Restart after rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use ed25519_dalek::{Signer, SigningKey};
    use tempfile::TempDir;

    use super::*;
    use crate::artifact::{file_digest, SignatureVerifier};
    use crate::jobs::ExecutorSettings;
    use crate::testing::{write_bundle, FakeArtifacts, FakeHost};

    const ARTIFACT_URL: &str = "https://releases.test/app.tgz";
    const SIGNATURE_URL: &str = "https://releases.test/app.tgz.sig";

    struct Fixture {
        tmp: TempDir,
        artifacts: Arc<FakeArtifacts>,
        host: Arc<FakeHost>,
        executor: JobExecutor,
    }

    impl Fixture {
        fn new(host: FakeHost) -> Self {
            Self::with_keep_backups(host, 5)
        }

        fn with_keep_backups(host: FakeHost, keep_backups: usize) -> Self {
            let tmp = TempDir::new().unwrap();
            let key = SigningKey::from_bytes(&[3u8; 32]);

            let bundle_path = tmp.path().join("release.tgz");
            write_bundle(&bundle_path, &[("VERSION", "2"), ("app/main.rb", "puts :v2")]);
            let signature = key.sign(&file_digest(&bundle_path).unwrap());

            let artifacts = Arc::new(FakeArtifacts::default());
            artifacts.serve(ARTIFACT_URL, fs::read(&bundle_path).unwrap());
            artifacts.serve(SIGNATURE_URL, hex::encode(signature.to_bytes()).into_bytes());

            let host = Arc::new(host);
            let settings = ExecutorSettings {
                work_dir: tmp.path().join("work"),
                deploy_dir: tmp.path().join("srv/current"),
                keep_backups,
                smoke_attempts: 2,
                smoke_delay: Duration::from_millis(1),
                step_timeout: Duration::from_secs(5),
                max_command_timeout: Duration::from_secs(30),
            };
            fs::create_dir_all(tmp.path().join("srv")).unwrap();

            let executor = JobExecutor::new(
                settings,
                artifacts.clone(),
                host.clone(),
                Some(SignatureVerifier::new(key.verifying_key())),
            );
            Self {
                tmp,
                artifacts,
                host,
                executor,
            }
        }

        fn live(&self) -> PathBuf {
            self.tmp.path().join("srv/current")
        }

        fn install_v1(&self) {
            let live = self.live();
            fs::create_dir_all(live.join("app")).unwrap();
            fs::write(live.join("VERSION"), "1").unwrap();
            fs::write(live.join("app/main.rb"), "puts :v1").unwrap();
            fs::write(live.join("app/extra.rb"), "only in v1").unwrap();
        }

        fn payload(&self) -> DeployBundle {
            DeployBundle {
                artifact_url: ARTIFACT_URL.to_string(),
                signature_url: SIGNATURE_URL.to_string(),
            }
        }

        async fn deploy(&self) -> JobOutcome {
            self.executor.deploy_bundle("job_test", &self.payload()).await
        }

        fn backups(&self) -> Vec<PathBuf> {
            match fs::read_dir(self.tmp.path().join("work/backups")) {
                Ok(dir) => dir.map(|e| e.unwrap().path()).collect(),
                Err(_) => Vec::new(),
            }
        }
    }

    /// Relative path → content for every file under `root`.
    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                (
                    e.path().strip_prefix(root).unwrap().to_path_buf(),
                    fs::read(e.path()).unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_deploy() {
        let fx = Fixture::new(FakeHost::default());
        fx.install_v1();

        let outcome = fx.deploy().await;
        let JobOutcome::Complete(result) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(result["ok"], true);
        assert!(result["backup"].as_str().unwrap().contains("job_test"));

        assert_eq!(fs::read_to_string(fx.live().join("VERSION")).unwrap(), "2");
        assert!(!fx.live().join("app/extra.rb").exists());
        assert!(!fx.tmp.path().join("srv/.current.retired").exists());
        assert_eq!(fx.backups().len(), 1);
        assert_eq!(fx.host.restarts(), 1);
        assert_eq!(fx.host.migrations(), 1);

        // The downloaded archive does not linger.
        let leftovers: Vec<_> = fs::read_dir(fx.tmp.path().join("work"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("bundle-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_discard_staging() {
        let tmp = TempDir::new().unwrap();
        let paths = ReleasePaths::for_live(&tmp.path().join("current")).unwrap();

        // Nothing staged yet.
        assert!(discard_staging(&paths).await);

        fs::create_dir_all(paths.staging.join("app")).unwrap();
        fs::write(paths.staging.join("app/main.rb"), "puts :half").unwrap();
        assert!(discard_staging(&paths).await);
        assert!(!paths.staging.exists());
    }

    #[tokio::test]
    async fn test_zero_retention_keeps_current_backup() {
        let fx = Fixture::with_keep_backups(FakeHost::default(), 0);
        fx.install_v1();

        let JobOutcome::Complete(result) = fx.deploy().await else {
            panic!("expected completion");
        };
        let backup = PathBuf::from(result["backup"].as_str().unwrap());
        assert!(backup.join("VERSION").exists());
        assert_eq!(fx.backups(), vec![backup]);
    }

    #[tokio::test]
    async fn test_smoke_failure_restores_identical_tree() {
        let fx = Fixture::new(FakeHost::failing_smoke());
        fx.install_v1();
        let before = snapshot(&fx.live());

        assert_eq!(
            fx.deploy().await,
            JobOutcome::Failed(FailureReason::SmokeTestFailed)
        );
        assert_eq!(snapshot(&fx.live()), before);
        assert_eq!(fx.host.smoke_checks(), 2);
        // Once for the deploy, once after rolling back.
        assert_eq!(fx.host.restarts(), 2);
    }

    #[tokio::test]
    async fn test_first_deploy_rolls_back_to_no_tree() {
        let fx = Fixture::new(FakeHost::failing_smoke());

        assert_eq!(
            fx.deploy().await,
            JobOutcome::Failed(FailureReason::SmokeTestFailed)
        );
        assert!(!fx.live().exists());
        assert!(fx.backups().is_empty());
    }

    #[tokio::test]
    async fn test_bad_signature_touches_nothing() {
        let fx = Fixture::new(FakeHost::default());
        fx.install_v1();
        let before = snapshot(&fx.live());
        fx.artifacts.serve(SIGNATURE_URL, hex::encode([0u8; 64]).into_bytes());

        assert_eq!(
            fx.deploy().await,
            JobOutcome::Failed(FailureReason::SignatureVerificationFailed)
        );
        assert_eq!(snapshot(&fx.live()), before);
        assert!(fx.backups().is_empty());
        assert_eq!(fx.host.restarts(), 0);
    }

    #[tokio::test]
    async fn test_missing_public_key_refuses() {
        let mut fx = Fixture::new(FakeHost::default());
        fx.executor.verifier = None;
        assert_eq!(
            fx.deploy().await,
            JobOutcome::Failed(FailureReason::SignatureVerificationFailed)
        );
    }

    #[tokio::test]
    async fn test_download_failure() {
        let fx = Fixture::new(FakeHost::default());
        fx.artifacts.forget(ARTIFACT_URL);
        assert_eq!(
            fx.deploy().await,
            JobOutcome::Failed(FailureReason::DownloadFailed)
        );
    }

    #[tokio::test]
    async fn test_corrupt_archive_leaves_live_tree() {
        let fx = Fixture::new(FakeHost::default());
        fx.install_v1();
        let before = snapshot(&fx.live());

        // Correctly signed garbage still fails to extract.
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let garbage = fx.tmp.path().join("garbage");
        fs::write(&garbage, b"not a tarball").unwrap();
        let signature = key.sign(&file_digest(&garbage).unwrap());
        fx.artifacts.serve(ARTIFACT_URL, fs::read(&garbage).unwrap());
        fx.artifacts.serve(SIGNATURE_URL, signature.to_bytes().to_vec());

        assert_eq!(
            fx.deploy().await,
            JobOutcome::Failed(FailureReason::UntarFailed)
        );
        assert_eq!(snapshot(&fx.live()), before);
        assert!(!fx.tmp.path().join("srv/.current.staging").exists());
        assert_eq!(fx.host.restarts(), 0);
    }

    #[tokio::test]
    async fn test_failed_migrations_do_not_block() {
        let fx = Fixture::new(FakeHost {
            fail_migrations: true,
            ..FakeHost::default()
        });
        assert!(matches!(fx.deploy().await, JobOutcome::Complete(_)));
    }
}
