// provisioner/src/main.rs

use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod orchestrator;
mod prompt;
mod sys;

use crate::config::{LogFormat, ProvisionConfig};
use crate::error::Result;
use crate::orchestrator::{Orchestrator, Outcome};
use crate::prompt::DialoguerPrompter;
use crate::sys::exec::SystemCommandRunner;
use crate::sys::preflight::{ensure_privileged, resolve_identity};
use crate::sys::traits::CommandRunner;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // ==============================================================================
    // 1. Configuration & Logging
    // ==============================================================================

    let config = match ProvisionConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.log_format);

    // ==============================================================================
    // 2. Run
    // ==============================================================================

    match run(config).await {
        Ok(Outcome::Completed(_)) | Ok(Outcome::Cancelled) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Installation failed: {e}");
            eprintln!("   Re-run the installer after fixing the problem; previous installs are kept as backups.");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ProvisionConfig) -> Result<Outcome> {
    // 🛡️ Preflight: nothing is prompted for or touched without root.
    ensure_privileged()?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
    let identity = resolve_identity(runner.as_ref()).await?;

    tracing::info!(
        operator = %identity.username,
        root = %config.install_root.display(),
        "⚙️ Lightstack provisioner starting"
    );

    // Instantiate the orchestrator with our dynamic configuration
    let mut orchestrator = Orchestrator::new(config, identity, runner);
    let outcome = orchestrator.run(&mut DialoguerPrompter).await;
    tracing::debug!(stage = %orchestrator.stage(), "orchestrator finished");
    outcome
}

/// Logs go to stderr so they never interleave with the prompts on stdout.
fn init_tracing(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
