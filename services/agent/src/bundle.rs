//! Release bundle handling on disk: extraction, backups, swap and rollback.
//!
//! These are blocking filesystem operations; callers run them on the blocking
//! pool. The live tree is only ever replaced by renames within its parent
//! directory, so a reader sees either the old tree or the new one.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive entry escapes the target directory: {0}")]
    UnsafeEntry(PathBuf),

    #[error("failed to walk tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("{0} has no parent directory")]
    NoParent(PathBuf),
}

/// The live tree and its two siblings used during a swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePaths {
    pub live: PathBuf,
    pub staging: PathBuf,
    pub retired: PathBuf,
}

impl ReleasePaths {
    pub fn for_live(live: &Path) -> Result<Self, BundleError> {
        let parent = live
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| BundleError::NoParent(live.to_path_buf()))?;
        let name = live
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "release".to_string());

        Ok(Self {
            live: live.to_path_buf(),
            staging: parent.join(format!(".{name}.staging")),
            retired: parent.join(format!(".{name}.retired")),
        })
    }
}

/// Unpacks a `.tar.gz` into `dest`, which is recreated empty first.
///
/// Entries with `..`, absolute paths or other escaping components are
/// rejected before anything is written for them.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize, BundleError> {
    remove_tree(dest)?;
    fs::create_dir_all(dest)?;

    let file = fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);

    let mut count = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BundleError::UnsafeEntry(path));
        }
        if !entry.unpack_in(dest)? {
            return Err(BundleError::UnsafeEntry(path));
        }
        count += 1;
    }

    debug!(archive = %archive.display(), entries = count, "Extracted archive");
    Ok(count)
}

/// Recursively copies `src` to `dst`, keeping symlinks as links.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64, BundleError> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, entry.metadata()?.permissions())?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            copied += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

/// Copies the live tree into `<backups_dir>/<UTC timestamp>-<label>`.
///
/// Returns `None` when there is no live tree yet.
pub fn backup(live: &Path, backups_dir: &Path, label: &str) -> Result<Option<PathBuf>, BundleError> {
    if !live.exists() {
        return Ok(None);
    }
    fs::create_dir_all(backups_dir)?;

    let dest = backups_dir.join(format!("{}-{label}", Utc::now().format("%Y%m%d%H%M%S")));
    let bytes = copy_tree(live, &dest)?;
    debug!(backup = %dest.display(), bytes, "Backed up live tree");
    Ok(Some(dest))
}

/// Deletes all but the newest `keep` backups. Names sort by timestamp.
pub fn prune_backups(backups_dir: &Path, keep: usize) -> Result<usize, BundleError> {
    if !backups_dir.exists() {
        return Ok(0);
    }

    let mut backups: Vec<PathBuf> = fs::read_dir(backups_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.path())
        .collect();
    backups.sort();

    let excess = backups.len().saturating_sub(keep);
    for old in &backups[..excess] {
        fs::remove_dir_all(old)?;
    }
    Ok(excess)
}

/// Moves staging into place, retiring the current live tree.
///
/// Returns whether a previous tree was retired. If staging cannot be moved in,
/// the retired tree is put back before the error is returned.
pub fn swap(paths: &ReleasePaths) -> Result<bool, BundleError> {
    remove_tree(&paths.retired)?;

    let had_previous = paths.live.exists();
    if had_previous {
        fs::rename(&paths.live, &paths.retired)?;
    }

    if let Err(e) = fs::rename(&paths.staging, &paths.live) {
        if had_previous {
            if let Err(restore) = fs::rename(&paths.retired, &paths.live) {
                warn!(error = %restore, "Failed to restore retired tree after swap failure");
            }
        }
        return Err(e.into());
    }
    Ok(had_previous)
}

/// Puts the pre-deploy tree back.
///
/// Prefers the retired tree, falls back to copying `backup`, and otherwise
/// leaves no live tree at all (the state before a first deploy).
pub fn rollback(paths: &ReleasePaths, backup: Option<&Path>) -> Result<(), BundleError> {
    remove_tree(&paths.live)?;

    if paths.retired.exists() {
        fs::rename(&paths.retired, &paths.live)?;
    } else if let Some(backup) = backup {
        copy_tree(backup, &paths.live)?;
    }
    Ok(())
}

/// Drops the retired tree once the new release is confirmed.
pub fn finish(paths: &ReleasePaths) -> Result<(), BundleError> {
    remove_tree(&paths.retired)
}

/// `remove_dir_all` that treats a missing path as done.
pub fn remove_tree(path: &Path) -> Result<(), BundleError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use crate::testing::write_bundle;
    use tempfile::TempDir;

    /// A tarball with a `..` entry; `tar::Builder` refuses to write one.
    fn write_evil_archive(path: &Path) {
        let content = b"owned";
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..9].copy_from_slice(b"../escape");
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();

        let file = fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.append(&header, &content[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_extract_archive() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("bundle.tgz");
        write_bundle(&archive, &[("app/main.rb", "puts 1"), ("VERSION", "2")]);

        let dest = tmp.path().join("out");
        assert_eq!(extract_archive(&archive, &dest).unwrap(), 2);
        assert_eq!(read(&dest.join("app/main.rb")), "puts 1");
        assert_eq!(read(&dest.join("VERSION")), "2");
    }

    #[test]
    fn test_extract_rejects_parent_dir_entries() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("evil.tgz");
        write_evil_archive(&archive);

        let dest = tmp.path().join("out");
        let err = extract_archive(&archive, &dest).unwrap_err();
        assert!(matches!(err, BundleError::UnsafeEntry(_)));
        assert!(!tmp.path().join("escape").exists());
    }

    #[test]
    fn test_extract_rejects_corrupt_archive() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("broken.tgz");
        fs::write(&archive, b"definitely not gzip").unwrap();
        assert!(extract_archive(&archive, &tmp.path().join("out")).is_err());
    }

    #[test]
    fn test_swap_and_rollback_restore_previous_tree() {
        let tmp = TempDir::new().unwrap();
        let paths = ReleasePaths::for_live(&tmp.path().join("current")).unwrap();

        fs::create_dir_all(&paths.live).unwrap();
        fs::write(paths.live.join("VERSION"), "1").unwrap();
        fs::create_dir_all(&paths.staging).unwrap();
        fs::write(paths.staging.join("VERSION"), "2").unwrap();

        assert!(swap(&paths).unwrap());
        assert_eq!(read(&paths.live.join("VERSION")), "2");
        assert!(!paths.staging.exists());

        rollback(&paths, None).unwrap();
        assert_eq!(read(&paths.live.join("VERSION")), "1");
        assert!(!paths.retired.exists());
    }

    #[test]
    fn test_rollback_falls_back_to_backup() {
        let tmp = TempDir::new().unwrap();
        let paths = ReleasePaths::for_live(&tmp.path().join("current")).unwrap();
        let saved = tmp.path().join("backup");
        fs::create_dir_all(saved.join("lib")).unwrap();
        fs::write(saved.join("lib/app.rb"), "v1").unwrap();

        fs::create_dir_all(&paths.live).unwrap();
        fs::write(paths.live.join("broken"), "v2").unwrap();

        rollback(&paths, Some(&saved)).unwrap();
        assert_eq!(read(&paths.live.join("lib/app.rb")), "v1");
        assert!(!paths.live.join("broken").exists());
    }

    #[test]
    fn test_first_deploy_rolls_back_to_nothing() {
        let tmp = TempDir::new().unwrap();
        let paths = ReleasePaths::for_live(&tmp.path().join("current")).unwrap();
        fs::create_dir_all(&paths.staging).unwrap();

        assert!(!swap(&paths).unwrap());
        rollback(&paths, None).unwrap();
        assert!(!paths.live.exists());
    }

    #[test]
    fn test_backup_and_prune() {
        let tmp = TempDir::new().unwrap();
        let live = tmp.path().join("current");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("a"), "x").unwrap();

        let backups = tmp.path().join("backups");
        assert!(backup(&tmp.path().join("missing"), &backups, "j0").unwrap().is_none());

        for label in ["j1", "j2", "j3"] {
            let dir = backup(&live, &backups, label).unwrap().unwrap();
            assert_eq!(read(&dir.join("a")), "x");
        }
        assert_eq!(prune_backups(&backups, 2).unwrap(), 1);

        let mut left: Vec<String> = fs::read_dir(&backups)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert!(left[0].ends_with("-j2"));
        assert!(left[1].ends_with("-j3"));
    }
}
