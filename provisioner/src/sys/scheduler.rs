// provisioner/src/sys/scheduler.rs

use crate::error::{ProvisionError, Result};
use crate::sys::traits::{CommandRunner, CommandSpec, JobIntent, JobScheduler};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

// ==============================================================================
// 1. Concrete Implementation (Systemd)
// ==============================================================================

pub struct SystemdTimerManager {
    systemd_dir: PathBuf, // Injected via ProvisionConfig, e.g., "/etc/systemd/system"
    runner: Arc<dyn CommandRunner>,
}

impl SystemdTimerManager {
    pub fn new(systemd_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            systemd_dir: systemd_dir.into(),
            runner,
        }
    }

    pub fn render_service(intent: &JobIntent) -> String {
        // Type=oneshot: the process exits when done, systemd must not
        // "restart" it like a web server.
        format!(
            r#"[Unit]
Description={description}
After=network-online.target
Wants=network-online.target

[Service]
Type=oneshot
ExecStart={command}
"#,
            description = intent.description,
            command = exec_line(intent)
        )
    }

    pub fn render_timer(intent: &JobIntent) -> String {
        format!(
            r#"[Unit]
Description=Timer for {description}

[Timer]
OnCalendar={schedule}
# If the server is down when the timer is supposed to fire,
# trigger it immediately upon boot.
Persistent=true
RandomizedDelaySec=1h

[Install]
WantedBy=timers.target
"#,
            description = intent.description,
            schedule = intent.schedule
        )
    }

    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        self.runner
            .run_checked(&CommandSpec::new("systemctl").args(args.iter().copied()))
            .await
            .map(|_| ())
            .map_err(|e| ProvisionError::Scheduler(e.to_string()))
    }
}

/// `binary arg...` with whitespace-bearing args double-quoted for systemd.
fn exec_line(intent: &JobIntent) -> String {
    let mut line = intent.binary.clone();
    for arg in &intent.args {
        line.push(' ');
        if arg.chars().any(char::is_whitespace) {
            line.push('"');
            line.push_str(&arg.replace('\\', "\\\\").replace('"', "\\\""));
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    line
}

#[async_trait]
impl JobScheduler for SystemdTimerManager {
    async fn ensure_job(&self, intent: &JobIntent) -> Result<bool> {
        let service_path = self.systemd_dir.join(format!("{}.service", intent.name));
        let timer_path = self.systemd_dir.join(format!("{}.timer", intent.name));
        let timer_name = format!("{}.timer", intent.name);

        let service_content = Self::render_service(intent);
        let timer_content = Self::render_timer(intent);

        // 1. Idempotency: an identical, enabled job is left alone.
        let unchanged = fs::read_to_string(&service_path).await.ok().as_deref()
            == Some(service_content.as_str())
            && fs::read_to_string(&timer_path).await.ok().as_deref() == Some(timer_content.as_str());
        if unchanged {
            let enabled = self
                .runner
                .run(&CommandSpec::new("systemctl").args(["is-enabled", "--quiet", timer_name.as_str()]))
                .await?;
            if enabled.success() {
                debug!(timer = %timer_name, "timer already registered");
                return Ok(false);
            }
        }

        // 2. Write both units, root-owned and world-readable.
        for (path, content) in [(&service_path, &service_content), (&timer_path, &timer_content)] {
            fs::write(path, content).await.map_err(ProvisionError::fs(path))?;
            fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
                .await
                .map_err(ProvisionError::fs(path))?;
        }

        // 3. Reload, then enable and start the timer (not the service!).
        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl(&["enable", "--now", &timer_name]).await?;

        Ok(true)
    }
}
