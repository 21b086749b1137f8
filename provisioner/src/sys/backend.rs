// provisioner/src/sys/backend.rs

use std::path::PathBuf;
use tracing::info;

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::sys::layout::{chown_recursive, copy_tree_blocking};
use crate::sys::preflight::Identity;
use crate::sys::secrets::{SecretsBundle, inject_admin_credentials, inject_signing_key};
use crate::sys::systemd::{ServiceManager, ServiceUnit};
use crate::sys::traits::{CommandRunner, CommandSpec};

/// Python libraries the FastAPI backend imports.
pub const BACKEND_LIBRARIES: &[&str] = &[
    "fastapi",
    "uvicorn",
    "pyjwt",
    "python-multipart",
    "pydantic",
];

/// Entry module of the backend; carries the placeholders.
pub const ENTRY_FILE: &str = "main.py";

/// Never copied from the source tree: they are host-local artefacts.
const SOURCE_EXCLUDES: &[&str] = &["venv", "__pycache__", ".venv"];

pub struct BackendProvisioner<'a> {
    config: &'a ProvisionConfig,
    identity: &'a Identity,
    runner: &'a dyn CommandRunner,
    services: &'a dyn ServiceManager,
}

impl<'a> BackendProvisioner<'a> {
    pub fn new(
        config: &'a ProvisionConfig,
        identity: &'a Identity,
        runner: &'a dyn CommandRunner,
        services: &'a dyn ServiceManager,
    ) -> Self {
        Self {
            config,
            identity,
            runner,
            services,
        }
    }

    pub fn unit(&self) -> ServiceUnit {
        let bin = self.config.venv_dir().join("bin");
        ServiceUnit {
            name: self.config.service_name.clone(),
            description: "Lightstack UI backend (FastAPI)".to_string(),
            user: self.identity.username.clone(),
            working_directory: self.config.backend_dir(),
            exec_start: format!(
                "{} main:app --host 127.0.0.1 --port {}",
                bin.join("uvicorn").display(),
                self.config.backend_port
            ),
            path_env: bin,
        }
    }

    /// Runs every backend step in order; the first failure stops the rest.
    /// The unit is left enabled but not started.
    pub async fn provision(&self, secrets: &SecretsBundle) -> Result<PathBuf> {
        let backend_dir = self.config.backend_dir();
        let venv = self.config.venv_dir();

        // 1. Isolated interpreter, scoped to the backend directory.
        info!(venv = %venv.display(), "🐍 creating virtualenv");
        let venv_str = venv.to_string_lossy();
        self.runner
            .run_checked(&CommandSpec::new("python3").args(["-m", "venv", venv_str.as_ref()]))
            .await?;

        // 2. Libraries go into the venv only.
        let pip = venv.join("bin").join("pip");
        self.runner
            .run_checked(
                &CommandSpec::new(pip.to_string_lossy())
                    .args(["install", "--upgrade"])
                    .args(BACKEND_LIBRARIES.iter().copied()),
            )
            .await?;

        // 3. Fresh copy of the sources over the previous install.
        let source = self.config.source_dir.join("backend");
        copy_tree_blocking(source, backend_dir.clone(), SOURCE_EXCLUDES).await?;

        // 4. Signing key.
        let entry = backend_dir.join(ENTRY_FILE);
        if !entry.is_file() {
            return Err(ProvisionError::SecretInjection {
                path: entry,
                token: crate::sys::secrets::SIGNING_KEY_PLACEHOLDER.to_string(),
                found: 0,
            });
        }
        inject_signing_key(&entry, &secrets.signing_key)?;

        // 5. Unit file.
        let unit = self.unit();
        let unit_path = self
            .services
            .write_unit_file(&unit, &secrets.signing_key)
            .await?;

        // 6. Admin credentials.
        inject_admin_credentials(&entry, &secrets.admin)?;

        // 7. The venv is never activated in a shell (its binaries are called by
        // absolute path), so there is nothing to deactivate. Hand the tree to
        // the operator and register the unit for boot.
        chown_recursive(self.runner, self.identity, &backend_dir).await?;
        self.services.reload_daemon().await?;
        self.services.enable(&unit.name).await?;

        info!(unit = %unit.name, "✅ backend provisioned (enabled, not started)");
        Ok(unit_path)
    }
}
