// provisioner/src/sys/systemd.rs

use async_trait::async_trait;
use std::fs as std_fs;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use zeroize::Zeroizing;

use crate::error::{ProvisionError, Result};
use crate::sys::secrets::SigningKey;
use crate::sys::traits::{CommandRunner, CommandSpec};

/// Name of the environment entry that carries the JWT signing key.
pub const SIGNING_KEY_ENV: &str = "JWT_SECRET_KEY";

pub struct ServiceUnit {
    pub name: String,
    pub description: String,
    pub user: String,
    pub working_directory: PathBuf,
    /// Value of the unit's `PATH`, scoped to the backend's virtualenv.
    pub path_env: PathBuf,
    pub exec_start: String,
}

impl ServiceUnit {
    /// Renders the unit with the signing key inlined. The result is zeroized
    /// when dropped.
    pub fn render(&self, key: &SigningKey) -> Zeroizing<String> {
        key.use_secret(|secret| {
            Zeroizing::new(format!(
                r#"[Unit]
Description={description}
After=network.target

[Service]
Type=simple
User={user}
WorkingDirectory={workdir}
Environment="PATH={path}"
Environment="{key_env}={secret}"
ExecStart={exec_start}
Restart=always

[Install]
WantedBy=multi-user.target
"#,
                description = self.description,
                user = self.user,
                workdir = self.working_directory.display(),
                path = self.path_env.display(),
                key_env = SIGNING_KEY_ENV,
                secret = secret,
                exec_start = self.exec_start,
            ))
        })
    }
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn write_unit_file(&self, unit: &ServiceUnit, key: &SigningKey) -> Result<PathBuf>;
    async fn reload_daemon(&self) -> Result<()>;
    /// Enables at boot without starting.
    async fn enable(&self, unit_name: &str) -> Result<()>;
    /// Starts the unit, or restarts it when it is already running.
    async fn restart(&self, unit_name: &str) -> Result<()>;
    async fn is_active(&self, unit_name: &str) -> Result<bool>;
}

pub struct LinuxSystemdManager {
    systemd_dir: PathBuf, // Injected path
    runner: Arc<dyn CommandRunner>,
}

impl LinuxSystemdManager {
    pub fn new(systemd_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            systemd_dir: systemd_dir.into(),
            runner,
        }
    }

    pub fn unit_path(&self, unit_name: &str) -> PathBuf {
        self.systemd_dir.join(format!("{unit_name}.service"))
    }

    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        self.runner
            .run_checked(&CommandSpec::new("systemctl").args(args.iter().copied()))
            .await
            .map(|_| ())
            .map_err(|e| ProvisionError::Service(e.to_string()))
    }
}

#[async_trait]
impl ServiceManager for LinuxSystemdManager {
    async fn write_unit_file(&self, unit: &ServiceUnit, key: &SigningKey) -> Result<PathBuf> {
        let path = self.unit_path(&unit.name);
        let content = unit.render(key);

        // 🛡️ The unit carries the signing key: root-only from the first byte.
        write_private(&path, content.as_bytes()).await?;

        info!(unit = %path.display(), "🧩 systemd unit written");
        Ok(path)
    }

    async fn reload_daemon(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"]).await
    }

    async fn enable(&self, unit_name: &str) -> Result<()> {
        self.systemctl(&["enable", unit_name]).await
    }

    async fn restart(&self, unit_name: &str) -> Result<()> {
        self.systemctl(&["restart", unit_name]).await
    }

    async fn is_active(&self, unit_name: &str) -> Result<bool> {
        let out = self
            .runner
            .run(&CommandSpec::new("systemctl").args(["is-active", "--quiet", unit_name]))
            .await?;
        Ok(out.success())
    }
}

/// Writes `bytes` with mode 0600, tightening an existing file first.
async fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    if fs::try_exists(path).await.unwrap_or(false) {
        fs::set_permissions(path, std_fs::Permissions::from_mode(0o600))
            .await
            .map_err(ProvisionError::fs(path))?;
    }

    let mut opts = std_fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o600); // rw-------

    let mut file = fs::OpenOptions::from(opts)
        .open(path)
        .await
        .map_err(ProvisionError::fs(path))?;
    file.write_all(bytes).await.map_err(ProvisionError::fs(path))?;
    file.sync_all().await.map_err(ProvisionError::fs(path))
}
