// provisioner/src/sys/exec.rs

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::sys::traits::{CommandOutput, CommandRunner, CommandSpec};

/// Runs tools on the real host. stdout/stderr are forwarded line by line to
/// the log while the process runs, and also captured for error reporting.
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        info!(command = %spec, "▶️ running");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProvisionError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Both pipes are drained together so a chatty tool can never block on
        // a full stderr buffer while we wait on stdout.
        let (stdout, stderr) = tokio::join!(
            drain(child.stdout.take(), "stdout"),
            drain(child.stderr.take(), "stderr"),
        );

        let status = child.wait().await.map_err(|source| ProvisionError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        debug!(command = %spec, code = ?status.code(), "finished");

        Ok(CommandOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

async fn drain<R>(stream: Option<R>, label: &'static str) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return String::new();
    };

    let mut collected = String::new();
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream = label, "{}", line);
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}
