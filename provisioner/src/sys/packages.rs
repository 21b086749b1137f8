// provisioner/src/sys/packages.rs

use regex::Regex;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::error::{ProvisionError, Result};
use crate::sys::traits::{CommandRunner, CommandSpec};

/// System packages the stack cannot run without.
pub const REQUIRED_PACKAGES: &[&str] = &[
    "python3",
    "python3-venv",
    "python3-pip",
    "nginx",
    "certbot",
    "python3-certbot-nginx",
    "curl",
];

const INSTALLED_STATUS: &str = "install ok installed";

pub struct DependencySet {
    pub packages: Vec<String>,
    pub node_min_major: u32,
}

impl DependencySet {
    pub fn standard(node_min_major: u32) -> Self {
        Self {
            packages: REQUIRED_PACKAGES.iter().map(|p| p.to_string()).collect(),
            node_min_major,
        }
    }
}

/// Outcome of a run, mostly for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub node_upgraded: bool,
}

pub struct AptInstaller<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> AptInstaller<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Leaves every entry of `deps` satisfied or fails the whole run.
    pub async fn ensure(&self, deps: &DependencySet) -> Result<InstallReport> {
        let mut report = InstallReport::default();

        let unmet = self.unmet_packages(&deps.packages).await;
        if unmet.is_empty() {
            info!("📦 all system packages already installed");
        } else {
            info!(packages = %unmet.join(" "), "📦 installing missing packages");
            // One index refresh, one batch install.
            self.apt(&["update"]).await?;
            let mut args = vec!["install", "-y"];
            args.extend(unmet.iter().map(String::as_str));
            self.apt(&args).await?;
            report.installed = unmet;
        }

        if !self.node_satisfies(deps.node_min_major).await {
            warn!(min_major = deps.node_min_major, "Node.js missing or too old, adding NodeSource");
            self.install_node(deps.node_min_major).await?;
            report.node_upgraded = true;
        }

        // 🛡️ Partial installation is never accepted.
        let still_unmet = self.unmet_packages(&deps.packages).await;
        if !still_unmet.is_empty() {
            return Err(ProvisionError::DependencyInstall(format!(
                "packages still missing after install: {}",
                still_unmet.join(", ")
            )));
        }
        if report.node_upgraded && !self.node_satisfies(deps.node_min_major).await {
            return Err(ProvisionError::DependencyInstall(format!(
                "Node.js is still older than v{} after upgrade",
                deps.node_min_major
            )));
        }

        Ok(report)
    }

    async fn unmet_packages(&self, packages: &[String]) -> Vec<String> {
        let mut unmet = Vec::new();
        for package in packages {
            if !self.is_installed(package).await {
                unmet.push(package.clone());
            }
        }
        unmet
    }

    async fn is_installed(&self, package: &str) -> bool {
        let spec = CommandSpec::new("dpkg-query").args(["-W", "-f=${Status}", package]);
        match self.runner.run(&spec).await {
            Ok(out) => out.success() && out.stdout.trim() == INSTALLED_STATUS,
            Err(_) => false,
        }
    }

    async fn node_satisfies(&self, min_major: u32) -> bool {
        let spec = CommandSpec::new("node").arg("--version");
        match self.runner.run(&spec).await {
            Ok(out) if out.success() => {
                node_major(&out.stdout).is_some_and(|major| major >= min_major)
            }
            _ => false,
        }
    }

    async fn install_node(&self, major: u32) -> Result<()> {
        let script = tempfile::Builder::new()
            .prefix("nodesource-setup-")
            .suffix(".sh")
            .tempfile()
            .map_err(|e| ProvisionError::DependencyInstall(format!("temp file: {e}")))?;
        let script_path = script.path().to_string_lossy().to_string();

        let url = format!("https://deb.nodesource.com/setup_{major}.x");
        self.checked(CommandSpec::new("curl").args(["-fsSL", url.as_str(), "-o", script_path.as_str()]))
            .await?;
        self.checked(CommandSpec::new("bash").arg(script_path.as_str()))
            .await?;
        self.apt(&["install", "-y", "nodejs"]).await
        // `script` drops here and removes the downloaded file.
    }

    async fn apt(&self, args: &[&str]) -> Result<()> {
        self.checked(
            CommandSpec::new("apt-get")
                .args(args.iter().copied())
                .env("DEBIAN_FRONTEND", "noninteractive"),
        )
        .await
    }

    async fn checked(&self, spec: CommandSpec) -> Result<()> {
        self.runner
            .run_checked(&spec)
            .await
            .map(|_| ())
            .map_err(|e| ProvisionError::DependencyInstall(e.to_string()))
    }
}

/// Extracts the major version from `node --version` output (`v20.11.1`).
pub fn node_major(version: &str) -> Option<u32> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^v?(\d+)\.").expect("static regex"));
    re.captures(version.trim())?.get(1)?.as_str().parse().ok()
}
