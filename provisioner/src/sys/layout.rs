// provisioner/src/sys/layout.rs

use chrono::{DateTime, Utc};
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{ProvisionError, Result};
use crate::sys::preflight::Identity;
use crate::sys::traits::{CommandRunner, CommandSpec};

/// Owns the install root: snapshots it, creates it, and hands it to the
/// operator.
pub struct LayoutManager<'a> {
    root: PathBuf,
    identity: &'a Identity,
    runner: &'a dyn CommandRunner,
}

impl<'a> LayoutManager<'a> {
    pub fn new(root: impl Into<PathBuf>, identity: &'a Identity, runner: &'a dyn CommandRunner) -> Self {
        Self {
            root: root.into(),
            identity,
            runner,
        }
    }

    /// `root.backup.<YYYYmmddHHMMSS>` next to the root, UTC.
    pub fn backup_path(&self, now: DateTime<Utc>) -> PathBuf {
        let mut name = self
            .root
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".backup.{}", now.format("%Y%m%d%H%M%S")));
        self.root.with_file_name(name)
    }

    /// Snapshots a pre-existing install before anything overwrites it.
    /// Must run before `ensure_layout` so the copy reflects the pre-run state.
    pub async fn backup_if_exists(&self, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
        if !self.root.exists() {
            debug!(root = %self.root.display(), "no previous installation, skipping backup");
            return Ok(None);
        }

        let target = self.backup_path(now);
        // 🛡️ Snapshots are never overwritten or merged.
        if target.exists() {
            return Err(ProvisionError::BackupExists(target));
        }

        info!(from = %self.root.display(), to = %target.display(), "🗄️ backing up existing installation");
        copy_tree_blocking(self.root.clone(), target.clone(), &[]).await?;
        self.chown_recursive(&target).await?;
        Ok(Some(target))
    }

    /// Creates `backend/` and `frontend/` (no error if present) and hands the
    /// whole root to the operator.
    pub async fn ensure_layout(&self) -> Result<()> {
        for sub in ["backend", "frontend"] {
            let dir = self.root.join(sub);
            tokio::fs::create_dir_all(&dir).await.map_err(ProvisionError::fs(&dir))?;
        }
        self.chown_recursive(&self.root).await
    }

    /// 🛡️ Recursive chown with symlink protection (`-h`): links inside the
    /// tree are re-owned, their targets are not.
    pub async fn chown_recursive(&self, path: &Path) -> Result<()> {
        chown_recursive(self.runner, self.identity, path).await
    }
}

pub async fn chown_recursive(runner: &dyn CommandRunner, identity: &Identity, path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy();
    runner
        .run_checked(&CommandSpec::new("chown").args([
            "-Rh",
            identity.owner_spec().as_str(),
            path_str.as_ref(),
        ]))
        .await
        .map(|_| ())
}

/// Runs `copy_tree` on the blocking pool so the walk never stalls the runtime.
pub async fn copy_tree_blocking(
    src: PathBuf,
    dst: PathBuf,
    excludes: &'static [&'static str],
) -> Result<u64> {
    let origin = src.clone();
    tokio::task::spawn_blocking(move || copy_tree(&src, &dst, excludes))
        .await
        .map_err(|e| ProvisionError::Filesystem {
            path: origin,
            source: std::io::Error::other(e),
        })?
}

/// Recursively copies `src` into `dst`, overwriting files that already exist.
/// Directories, regular files, symlinks and permission bits are reproduced.
/// Top-level entries named in `excludes` are skipped together with their
/// contents.
pub fn copy_tree(src: &Path, dst: &Path, excludes: &[&str]) -> Result<u64> {
    if !src.is_dir() {
        return Err(ProvisionError::Filesystem {
            path: src.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "source directory missing"),
        });
    }

    let mut copied = 0;
    let walker = WalkDir::new(src).follow_links(false).into_iter().filter_entry(|entry| {
        entry.depth() != 1
            || !excludes
                .iter()
                .any(|ex| entry.file_name().to_str() == Some(*ex))
    });

    for entry in walker {
        let entry = entry.map_err(|e| ProvisionError::Filesystem {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf()),
            source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("filesystem loop")),
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| ProvisionError::Filesystem {
                path: entry.path().to_path_buf(),
                source: std::io::Error::other(e),
            })?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(ProvisionError::fs(&target))?;
            let mode = entry
                .metadata()
                .map_err(|e| ProvisionError::Filesystem {
                    path: entry.path().to_path_buf(),
                    source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("metadata")),
                })?
                .permissions()
                .mode();
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                .map_err(ProvisionError::fs(&target))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(ProvisionError::fs(entry.path()))?;
            if target.symlink_metadata().is_ok() {
                remove_any(&target)?;
            }
            symlink(&link, &target).map_err(ProvisionError::fs(&target))?;
            copied += 1;
        } else {
            if target.is_dir() && !target.is_symlink() {
                fs::remove_dir_all(&target).map_err(ProvisionError::fs(&target))?;
            } else if target.is_symlink() {
                remove_any(&target)?;
            }
            // fs::copy carries the permission bits along with the bytes.
            fs::copy(entry.path(), &target).map_err(ProvisionError::fs(&target))?;
            copied += 1;
        }
    }

    debug!(from = %src.display(), to = %dst.display(), files = copied, "tree copied");
    Ok(copied)
}

fn remove_any(path: &Path) -> Result<()> {
    let meta = path.symlink_metadata().map_err(ProvisionError::fs(path))?;
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(ProvisionError::fs(path))
    } else {
        fs::remove_file(path).map_err(ProvisionError::fs(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::testing::ScriptedRunner;
    use chrono::TimeZone;

    fn operator() -> Identity {
        Identity {
            username: "alice".into(),
            home: PathBuf::from("/home/alice"),
            uid: 1000,
            gid: 1000,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 8, 30, 5).unwrap()
    }

    fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut files: Vec<_> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                (
                    e.path().strip_prefix(dir).unwrap().to_path_buf(),
                    fs::read(e.path()).unwrap(),
                )
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn backup_name_is_a_sibling_with_second_precision() {
        let runner = ScriptedRunner::new();
        let id = operator();
        let mgr = LayoutManager::new("/opt/lightstack-ui", &id, &runner);
        assert_eq!(
            mgr.backup_path(fixed_now()),
            PathBuf::from("/opt/lightstack-ui.backup.20261016083005")
        );
    }

    #[tokio::test]
    async fn fresh_host_gets_no_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let id = operator();
        let mgr = LayoutManager::new(tmp.path().join("ui"), &id, &runner);

        assert_eq!(mgr.backup_if_exists(fixed_now()).await.unwrap(), None);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn existing_install_is_copied_byte_for_byte_and_chowned() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ui");
        fs::create_dir_all(root.join("backend/venv/bin")).unwrap();
        fs::create_dir_all(root.join("frontend/dist")).unwrap();
        fs::write(root.join("backend/main.py"), "SECRET_KEY = 'abc'\n").unwrap();
        fs::write(root.join("backend/venv/bin/python"), [0u8, 159, 146, 150]).unwrap();
        fs::write(root.join("frontend/dist/index.html"), "<html></html>").unwrap();
        symlink("main.py", root.join("backend/entry.py")).unwrap();
        let before = snapshot(&root);

        let runner = ScriptedRunner::new();
        let id = operator();
        let mgr = LayoutManager::new(&root, &id, &runner);
        let backup = mgr.backup_if_exists(fixed_now()).await.unwrap().unwrap();

        assert_eq!(snapshot(&backup), before);
        assert_eq!(
            fs::read_link(backup.join("backend/entry.py")).unwrap(),
            PathBuf::from("main.py")
        );
        assert_eq!(
            runner.command_lines(),
            vec![format!("chown -Rh 1000:1000 {}", backup.display())]
        );

        // Exactly one new sibling directory.
        let siblings: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("ui.backup."))
            .collect();
        assert_eq!(siblings, vec!["ui.backup.20261016083005".to_string()]);
    }

    #[tokio::test]
    async fn colliding_snapshot_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ui");
        fs::create_dir_all(&root).unwrap();
        let runner = ScriptedRunner::new();
        let id = operator();
        let mgr = LayoutManager::new(&root, &id, &runner);
        fs::create_dir_all(mgr.backup_path(fixed_now())).unwrap();

        let err = mgr.backup_if_exists(fixed_now()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::BackupExists(_)));
    }

    #[tokio::test]
    async fn ensure_layout_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ui");
        let runner = ScriptedRunner::new();
        let id = operator();
        let mgr = LayoutManager::new(&root, &id, &runner);

        mgr.ensure_layout().await.unwrap();
        fs::write(root.join("backend/keep.txt"), "x").unwrap();
        mgr.ensure_layout().await.unwrap();

        assert!(root.join("backend").is_dir());
        assert!(root.join("frontend").is_dir());
        assert!(root.join("backend/keep.txt").exists());
        assert_eq!(runner.count(&format!("chown -Rh 1000:1000 {}", root.display())), 2);
    }

    #[test]
    fn copy_tree_skips_top_level_excludes_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("node_modules/react")).unwrap();
        fs::create_dir_all(src.join("src/node_modules")).unwrap();
        fs::write(src.join("package.json"), "{\"v\":2}").unwrap();
        fs::write(src.join("node_modules/react/index.js"), "x").unwrap();
        fs::write(src.join("src/node_modules/keep.js"), "y").unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("package.json"), "{\"v\":1}").unwrap();

        let copied = copy_tree(&src, &dst, &["node_modules"]).unwrap();

        assert_eq!(copied, 2);
        assert_eq!(fs::read_to_string(dst.join("package.json")).unwrap(), "{\"v\":2}");
        assert!(!dst.join("node_modules").exists());
        assert!(dst.join("src/node_modules/keep.js").exists());
    }

    #[test]
    fn copy_tree_preserves_permission_bits() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let script = src.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();

        copy_tree(&src, &tmp.path().join("dst"), &[]).unwrap();

        let mode = fs::metadata(tmp.path().join("dst/run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn copy_tree_requires_a_source_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let err = copy_tree(&tmp.path().join("absent"), &tmp.path().join("dst"), &[]).unwrap_err();
        assert!(matches!(err, ProvisionError::Filesystem { .. }));
    }
}
