// provisioner/src/error.rs

use std::io;
use std::path::PathBuf;

/// Every failure a provisioning step can report. The orchestrator stops at the
/// first one it sees; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("this installer must be run as root (try: sudo lightstack-provision)")]
    Privilege,

    #[error("could not resolve the invoking user: {0}")]
    IdentityResolution(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dependency installation failed: {0}")]
    DependencyInstall(String),

    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backup target {} already exists; refusing to overwrite a snapshot", .0.display())]
    BackupExists(PathBuf),

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {}: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("signing key placeholder `{token}` found {found} time(s) in {} (expected exactly once)", .path.display())]
    SecretInjection {
        path: PathBuf,
        token: String,
        found: usize,
    },

    #[error("credential placeholder `{token}` found {found} time(s) in {} (expected exactly once)", .path.display())]
    CredentialInjection {
        path: PathBuf,
        token: String,
        found: usize,
    },

    #[error("invalid domain name '{0}'")]
    InvalidDomain(String),

    #[error("generated nginx configuration rejected, nginx was not reloaded: {0}")]
    ProxyConfigInvalid(String),

    #[error("nginx site is not active at {}; configure the proxy before requesting a certificate", .0.display())]
    ProxySiteInactive(PathBuf),

    #[error("certificate issuance failed (the site is still served over HTTP): {0}")]
    CertificateIssuance(String),

    #[error("service management failed: {0}")]
    Service(String),

    #[error("renewal job registration failed: {0}")]
    Scheduler(String),

    #[error("prompt failed: {0}")]
    Prompt(String),
}

impl ProvisionError {
    /// Wraps an `io::Error` with the path that produced it.
    pub fn fs(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| ProvisionError::Filesystem { path, source }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
