// provisioner/src/sys/preflight.rs

use nix::unistd::{User, geteuid};
use std::env;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::sys::traits::{CommandRunner, CommandSpec};

/// The human operator behind `sudo`. Every tree the installer generates is
/// handed to this account, never left owned by root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub home: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    /// `uid:gid` form for `chown`, avoids a second name lookup.
    pub fn owner_spec(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }
}

/// Fails fast unless the effective UID is root.
pub fn ensure_privileged() -> Result<()> {
    if geteuid().is_root() {
        Ok(())
    } else {
        Err(ProvisionError::Privilege)
    }
}

/// Resolves the operator against the live host: terminal login, then the
/// session, sudo and generic user variables.
pub async fn resolve_identity(runner: &dyn CommandRunner) -> Result<Identity> {
    resolve_identity_with(runner, |key| env::var(key).ok(), lookup_account).await
}

/// Resolution order:
/// 1. `logname` (the user owning the controlling terminal)
/// 2. `$LOGNAME`
/// 3. `$SUDO_USER`
/// 4. `$USER`
///
/// The first non-empty candidate wins and must exist in the account database.
pub async fn resolve_identity_with<E, A>(
    runner: &dyn CommandRunner,
    env_lookup: E,
    accounts: A,
) -> Result<Identity>
where
    E: Fn(&str) -> Option<String>,
    A: Fn(&str) -> Result<Option<Identity>>,
{
    let from_terminal = match runner.run(&CommandSpec::new("logname")).await {
        Ok(out) if out.success() => Some(out.stdout.trim().to_string()),
        // No controlling terminal (cron, CI, `sudo -i` in some setups).
        _ => None,
    };

    let candidate = from_terminal
        .into_iter()
        .chain(
            ["LOGNAME", "SUDO_USER", "USER"]
                .into_iter()
                .filter_map(|key| env_lookup(key)),
        )
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .ok_or_else(|| {
            ProvisionError::IdentityResolution(
                "no username from logname, LOGNAME, SUDO_USER or USER".into(),
            )
        })?;

    debug!(candidate = %candidate, "resolving operator account");

    let identity = accounts(&candidate)?.ok_or_else(|| {
        ProvisionError::IdentityResolution(format!("user '{candidate}' has no account entry"))
    })?;

    if identity.home.as_os_str().is_empty() {
        return Err(ProvisionError::IdentityResolution(format!(
            "user '{}' has no home directory",
            identity.username
        )));
    }

    info!(user = %identity.username, home = %identity.home.display(), "👤 operator resolved");
    Ok(identity)
}

fn lookup_account(name: &str) -> Result<Option<Identity>> {
    let user = User::from_name(name).map_err(|e| {
        ProvisionError::IdentityResolution(format!("account lookup for '{name}' failed: {e}"))
    })?;

    Ok(user.map(|u| Identity {
        username: u.name,
        home: u.dir,
        uid: u.uid.as_raw(),
        gid: u.gid.as_raw(),
    }))
}
