use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};

// ==============================================================================
// 1. External Tool Execution (the only door to the host)
// ==============================================================================

/// One invocation of an external tool.
/// 🛡️ Discrete program + args: nothing is ever handed to a shell for parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion. A non-zero exit is NOT an error here;
    /// only a failure to spawn or wait is.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Runs the command and turns a non-zero exit into `CommandFailed`.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ProvisionError::CommandFailed {
                command: spec.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

// ==============================================================================
// 2. Proxy Abstraction (site generation + activation)
// ==============================================================================

#[async_trait]
pub trait ProxyManager: Send + Sync {
    /// Writes, validates and activates the site. Returns the path of the
    /// enabled-site link.
    async fn activate_site(&self, site: &crate::sys::proxy::SiteDescriptor) -> Result<PathBuf>;

    /// Reloads the running proxy with whatever configuration is active.
    async fn reload(&self) -> Result<()>;

    /// Location of the enabled-site link for `site`.
    fn enabled_path(&self, site: &str) -> PathBuf;

    /// True when `site` is linked into the enabled set.
    fn is_site_active(&self, site: &str) -> bool;
}

// ==============================================================================
// 3. Certificate Abstraction (delegated issuance)
// ==============================================================================

pub struct CertificateRequest {
    pub domain: String,
    pub email: String,
}

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Obtains a certificate and rewrites the active site for HTTPS redirection.
    async fn issue(&self, request: &CertificateRequest) -> Result<()>;
}

// ==============================================================================
// 4. Job Scheduling Abstraction
// ==============================================================================

/// 🛡️ Discrete fields prevent shell injection via OS execve.
pub struct JobIntent {
    pub name: String,
    pub description: String,
    pub binary: String,
    pub args: Vec<String>,
    pub schedule: String, // Systemd OnCalendar format
}

#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Registers the job unless an identical one is already in place.
    /// Returns `true` when something was (re)written.
    async fn ensure_job(&self, intent: &JobIntent) -> Result<bool>;
}
