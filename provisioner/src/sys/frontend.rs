// provisioner/src/sys/frontend.rs

use std::path::PathBuf;
use tracing::info;

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::sys::layout::{chown_recursive, copy_tree_blocking};
use crate::sys::preflight::Identity;
use crate::sys::traits::{CommandRunner, CommandSpec};

/// Host-local build artefacts that must never be copied from the source tree.
const SOURCE_EXCLUDES: &[&str] = &["node_modules", "dist"];

pub struct FrontendProvisioner<'a> {
    config: &'a ProvisionConfig,
    identity: &'a Identity,
    runner: &'a dyn CommandRunner,
}

impl<'a> FrontendProvisioner<'a> {
    pub fn new(config: &'a ProvisionConfig, identity: &'a Identity, runner: &'a dyn CommandRunner) -> Self {
        Self {
            config,
            identity,
            runner,
        }
    }

    /// Copies the sources, builds them as the operator and returns the static
    /// asset root.
    pub async fn provision(&self) -> Result<PathBuf> {
        let frontend_dir = self.config.frontend_dir();

        copy_tree_blocking(self.config.source_dir.join("frontend"), frontend_dir.clone(), SOURCE_EXCLUDES).await?;
        // npm runs as the operator and must be able to write here.
        chown_recursive(self.runner, self.identity, &frontend_dir).await?;

        info!(dir = %frontend_dir.display(), user = %self.identity.username, "📦 installing frontend dependencies");
        self.npm(&["install"]).await?;

        info!("🏗️ building frontend");
        self.npm(&["run", "build"]).await?;

        let static_root = self.config.static_root();
        if !static_root.is_dir() {
            return Err(ProvisionError::Filesystem {
                path: static_root,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "frontend build produced no output directory",
                ),
            });
        }

        // Build tools occasionally leave root-owned files behind.
        chown_recursive(self.runner, self.identity, &frontend_dir).await?;
        Ok(static_root)
    }

    /// Runs npm through `runuser` so caches land in the operator's home, not root's.
    async fn npm(&self, args: &[&str]) -> Result<()> {
        let spec = CommandSpec::new("runuser")
            .args(["-u", self.identity.username.as_str(), "--", "npm"])
            .args(args.iter().copied())
            .current_dir(self.config.frontend_dir())
            .env("HOME", self.identity.home.to_string_lossy());
        self.runner.run_checked(&spec).await.map(|_| ())
    }
}
