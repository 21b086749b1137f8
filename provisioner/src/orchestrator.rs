// provisioner/src/orchestrator.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::prompt::{self, Prompter, is_affirmative};
use crate::sys::backend::BackendProvisioner;
use crate::sys::frontend::FrontendProvisioner;
use crate::sys::layout::{LayoutManager, chown_recursive};
use crate::sys::packages::{AptInstaller, DependencySet};
use crate::sys::preflight::Identity;
use crate::sys::proxy::{NginxManager, SiteDescriptor, validate_domain_format};
use crate::sys::scheduler::SystemdTimerManager;
use crate::sys::secrets::{AdminCredentials, SecretsBundle, SigningKey};
use crate::sys::ssl::{CertbotIssuer, TlsProvisioner};
use crate::sys::systemd::{LinuxSystemdManager, ServiceManager};
use crate::sys::traits::{
    CertificateIssuer, CertificateRequest, CommandRunner, JobScheduler, ProxyManager,
};

pub const RECEIPT_FILE: &str = ".lightstack-install.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Start,
    ParamsCollected,
    Confirmed,
    BackedUp,
    Provisioned,
    TlsProvisioned,
    ServicesStarted,
    Done,
    Aborted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the operator typed. The password never leaves its `SecretString`.
pub struct StackParams {
    pub domain: String,
    pub email: String,
    pub admin: AdminCredentials,
}

#[derive(Debug)]
pub enum Outcome {
    Completed(InstallReceipt),
    Cancelled,
}

/// Written next to the installation so later runs and humans can see what is
/// deployed. Contains no secret material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub installer_version: String,
    pub installed_at: DateTime<Utc>,
    pub domain: String,
    pub email: String,
    pub admin_username: String,
    pub service: String,
    pub unit_file: PathBuf,
    pub site: String,
    pub static_root: PathBuf,
    pub backend_port: u16,
    pub backup: Option<PathBuf>,
}

impl InstallReceipt {
    pub fn url(&self) -> String {
        format!("https://{}", self.domain)
    }

    pub fn write(&self, root: &Path) -> Result<PathBuf> {
        let path = root.join(RECEIPT_FILE);
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| ProvisionError::Filesystem { path: path.clone(), source: e.into() })?;
        fs::write(&path, body).map_err(ProvisionError::fs(&path))?;
        Ok(path)
    }

    pub fn read(root: &Path) -> Result<Self> {
        let path = root.join(RECEIPT_FILE);
        let body = fs::read_to_string(&path).map_err(ProvisionError::fs(&path))?;
        serde_json::from_str(&body).map_err(|e| ProvisionError::Filesystem { path, source: e.into() })
    }
}

// ==============================================================================
// Orchestrator: one linear run, first failure aborts
// ==============================================================================

pub struct Orchestrator {
    config: ProvisionConfig,
    identity: Identity,
    runner: Arc<dyn CommandRunner>,
    svc_mgr: Box<dyn ServiceManager>,
    proxy_mgr: Box<dyn ProxyManager>,
    issuer: Box<dyn CertificateIssuer>,
    scheduler: Box<dyn JobScheduler>,
    stage: Stage,
}

impl Orchestrator {
    pub fn new(config: ProvisionConfig, identity: Identity, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            // Injecting paths via config
            svc_mgr: Box::new(LinuxSystemdManager::new(config.systemd_dir.clone(), runner.clone())),
            proxy_mgr: Box::new(NginxManager::new(config.nginx_dir.clone(), runner.clone())),
            issuer: Box::new(CertbotIssuer::new(runner.clone())),
            scheduler: Box::new(SystemdTimerManager::new(config.systemd_dir.clone(), runner.clone())),
            config,
            identity,
            runner,
            stage: Stage::Start,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, next: Stage) {
        info!(from = %self.stage, to = %next, "➡️ stage");
        self.stage = next;
    }

    pub async fn run(&mut self, prompter: &mut dyn Prompter) -> Result<Outcome> {
        let result = self.drive(prompter).await;
        if let Err(e) = &result {
            error!(stage = %self.stage, error = %e, "🛑 provisioning aborted");
            self.advance(Stage::Aborted);
        }
        result
    }

    async fn drive(&mut self, prompter: &mut dyn Prompter) -> Result<Outcome> {
        // 1. Parameters. Nothing on the host has changed yet.
        let params = collect_params(prompter)?;
        self.advance(Stage::ParamsCollected);

        // 2. Explicit confirmation gate.
        prompter.say(&self.summary(&params));
        let answer = prompter.input(
            &format!("Proceed with the installation? Type '{}' to continue", prompt::AFFIRMATIVE),
            prompt::any_text,
        )?;
        if !is_affirmative(&answer) {
            self.advance(Stage::Aborted);
            prompter.say("Installation cancelled. Nothing was changed.");
            return Ok(Outcome::Cancelled);
        }
        self.advance(Stage::Confirmed);

        // 3. System packages and Node.js.
        let report = AptInstaller::new(self.runner.as_ref())
            .ensure(&DependencySet::standard(self.config.node_major))
            .await?;
        info!(installed = report.installed.len(), node_upgraded = report.node_upgraded, "📦 dependencies ready");

        // 4. Snapshot, then make sure the layout exists.
        if let Ok(previous) = InstallReceipt::read(&self.config.install_root) {
            info!(
                domain = %previous.domain,
                installed_at = %previous.installed_at,
                "found previous installation"
            );
        }
        let layout = LayoutManager::new(&self.config.install_root, &self.identity, self.runner.as_ref());
        let backup = layout.backup_if_exists(Utc::now()).await?;
        layout.ensure_layout().await?;
        self.advance(Stage::BackedUp);

        // 5. Backend, frontend, proxy.
        let secrets = SecretsBundle {
            signing_key: SigningKey::generate(),
            admin: params.admin,
        };
        let unit_file = BackendProvisioner::new(
            &self.config,
            &self.identity,
            self.runner.as_ref(),
            self.svc_mgr.as_ref(),
        )
        .provision(&secrets)
        .await?;
        let static_root = FrontendProvisioner::new(&self.config, &self.identity, self.runner.as_ref())
            .provision()
            .await?;
        let site = SiteDescriptor::spa_with_api(
            &self.config.site_name,
            &params.domain,
            &static_root,
            self.config.backend_port,
        );
        self.proxy_mgr.activate_site(&site).await?;
        self.advance(Stage::Provisioned);

        // 6. TLS on the live site, plus automatic renewal.
        let request = CertificateRequest {
            domain: params.domain.clone(),
            email: params.email.clone(),
        };
        TlsProvisioner::new(self.proxy_mgr.as_ref(), self.issuer.as_ref(), self.scheduler.as_ref())
            .provision(&self.config.site_name, &request)
            .await?;
        self.advance(Stage::TlsProvisioned);

        // 7. Start (or restart, so a re-run picks up the new key) and reload.
        self.svc_mgr.restart(&self.config.service_name).await?;
        if !self.svc_mgr.is_active(&self.config.service_name).await? {
            return Err(ProvisionError::Service(format!(
                "{} did not become active; see `journalctl -u {}`",
                self.config.service_name,
                self.config.unit_file_name()
            )));
        }
        self.proxy_mgr.reload().await?;
        self.advance(Stage::ServicesStarted);

        // 8. Receipt and final report.
        let receipt = InstallReceipt {
            installer_version: env!("CARGO_PKG_VERSION").to_string(),
            installed_at: Utc::now(),
            domain: params.domain,
            email: params.email,
            admin_username: secrets.admin.username.clone(),
            service: self.config.service_name.clone(),
            unit_file,
            site: self.config.site_name.clone(),
            static_root,
            backend_port: self.config.backend_port,
            backup,
        };
        let receipt_path = receipt.write(&self.config.install_root)?;
        chown_recursive(self.runner.as_ref(), &self.identity, &receipt_path).await?;
        self.advance(Stage::Done);

        prompter.say(&format!("✅ Installation complete: {}", receipt.url()));
        if let Some(path) = &receipt.backup {
            prompter.say(&format!("Previous installation saved to {}", path.display()));
        }
        prompter.say(&format!(
            "Save the password for admin user '{}' now: it is not stored anywhere readable.",
            receipt.admin_username
        ));
        Ok(Outcome::Completed(receipt))
    }

    fn summary(&self, params: &StackParams) -> String {
        format!(
            "About to install Lightstack UI:\n  domain:      {}\n  email:       {}\n  admin user:  {}\n  admin pass:  ********\n  install dir: {}\n  operator:    {}",
            params.domain,
            params.email,
            params.admin.username,
            self.config.install_root.display(),
            self.identity.username,
        )
    }
}

fn collect_params(prompter: &mut dyn Prompter) -> Result<StackParams> {
    let domain = prompter.input("Domain (e.g. example.com)", prompt::domain)?;
    validate_domain_format(&domain)?;
    let email = prompter.input("Email for Let's Encrypt notices", prompt::email)?;
    let username = prompter.input("Admin username", prompt::username)?;
    let password = prompter.password("Admin password")?;
    Ok(StackParams {
        domain,
        email,
        admin: AdminCredentials { username, password },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::testing::ScriptedPrompter;
    use crate::sys::testing::ScriptedRunner;
    use crate::sys::traits::{CommandOutput, CommandSpec};
    use async_trait::async_trait;

    const MAIN_PY: &str = r#"SECRET_KEY = "your-secret-key"

users_db = {
    "admin": {
        "username": "admin",
        "password": "adminpassword",
    }
}
"#;

    /// Stands in for the real `npm run build` by producing the bundle.
    struct BuildingRunner {
        inner: Arc<ScriptedRunner>,
        dist: PathBuf,
    }

    #[async_trait]
    impl CommandRunner for BuildingRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            if spec.args.ends_with(&["npm".to_string(), "run".to_string(), "build".to_string()]) {
                fs::create_dir_all(&self.dist).unwrap();
                fs::write(self.dist.join("index.html"), "<html></html>").unwrap();
            }
            self.inner.run(spec).await
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        config: ProvisionConfig,
        scripted: Arc<ScriptedRunner>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let source = tmp.path().join("ui");
            fs::create_dir_all(source.join("backend")).unwrap();
            fs::create_dir_all(source.join("frontend/src")).unwrap();
            fs::write(source.join("backend/main.py"), MAIN_PY).unwrap();
            fs::write(source.join("frontend/package.json"), "{}").unwrap();
            fs::create_dir_all(tmp.path().join("systemd")).unwrap();

            let config = ProvisionConfig {
                install_root: tmp.path().join("opt/lightstack-ui"),
                source_dir: source,
                systemd_dir: tmp.path().join("systemd"),
                nginx_dir: tmp.path().join("nginx"),
                ..ProvisionConfig::default()
            };

            let scripted = Arc::new(ScriptedRunner::new());
            scripted.stdout("dpkg-query", "install ok installed");
            scripted.stdout("node --version", "v20.11.1\n");

            Self { tmp, config, scripted }
        }

        fn orchestrator(&self) -> Orchestrator {
            let runner = Arc::new(BuildingRunner {
                inner: self.scripted.clone(),
                dist: self.config.static_root(),
            });
            Orchestrator::new(self.config.clone(), operator(), runner)
        }

        fn backups(&self) -> Vec<String> {
            fs::read_dir(self.tmp.path().join("opt"))
                .unwrap()
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| n.starts_with("lightstack-ui.backup."))
                .collect()
        }
    }

    fn operator() -> Identity {
        Identity {
            username: "alice".into(),
            home: PathBuf::from("/home/alice"),
            uid: 1000,
            gid: 1000,
        }
    }

    fn answers(confirm: &str) -> ScriptedPrompter {
        ScriptedPrompter::new(&["example.com", "admin@example.com", "admin", "S3cret!", confirm])
    }

    #[tokio::test]
    async fn declining_changes_nothing_and_runs_nothing() {
        let fx = Fixture::new();
        let mut orch = fx.orchestrator();
        let mut prompter = answers("n");

        let outcome = orch.run(&mut prompter).await.unwrap();

        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(orch.stage(), Stage::Aborted);
        assert!(fx.scripted.calls().is_empty());
        assert!(!fx.config.install_root.exists());
        assert!(!fx.config.nginx_dir.exists());
        assert_eq!(fs::read_dir(&fx.config.systemd_dir).unwrap().count(), 0);
        assert!(prompter.transcript.iter().any(|l| l.contains("cancelled")));
    }

    #[tokio::test]
    async fn anything_but_the_affirmative_token_cancels() {
        for answer in ["", "y", "yes", "N"] {
            let fx = Fixture::new();
            let outcome = fx.orchestrator().run(&mut answers(answer)).await.unwrap();
            assert!(matches!(outcome, Outcome::Cancelled), "{answer:?}");
            assert!(fx.scripted.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn malformed_domain_is_refused_before_anything_runs() {
        let fx = Fixture::new();
        let mut orch = fx.orchestrator();
        let mut prompter = ScriptedPrompter::new(&["exa mple.com"]);

        assert!(orch.run(&mut prompter).await.is_err());
        assert_eq!(orch.stage(), Stage::Aborted);
        assert!(fx.scripted.calls().is_empty());
    }

    #[tokio::test]
    async fn full_run_reaches_done_in_order() {
        let fx = Fixture::new();
        let mut orch = fx.orchestrator();
        let mut prompter = answers("S");

        let outcome = orch.run(&mut prompter).await.unwrap();
        let Outcome::Completed(receipt) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(orch.stage(), Stage::Done);
        assert_eq!(receipt.url(), "https://example.com");
        assert_eq!(receipt.backup, None);

        let r = &fx.scripted;
        let order = [
            "dpkg-query",
            "python3 -m venv",
            "runuser -u alice -- npm install",
            "runuser -u alice -- npm run build",
            "nginx -t",
            "certbot --nginx",
            "systemctl restart lightstack-ui",
            "systemctl is-active --quiet lightstack-ui",
        ];
        let positions: Vec<_> = order.iter().map(|p| r.position(p).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", r.command_lines());
        assert!(r.position("systemctl enable lightstack-ui").unwrap() < positions[6]);
        let last_reload = r
            .command_lines()
            .iter()
            .rposition(|c| c == "systemctl reload nginx")
            .unwrap();
        assert!(last_reload > positions[7]);

        // Secrets landed where they belong and nowhere else.
        let main_py = fs::read_to_string(fx.config.backend_dir().join("main.py")).unwrap();
        assert!(!main_py.contains("your-secret-key"));
        assert!(main_py.contains("\"password\": \"S3cret!\""));
        let unit = fs::read_to_string(fx.config.systemd_dir.join("lightstack-ui.service")).unwrap();
        assert!(unit.contains("JWT_SECRET_KEY="));

        let receipt_body = fs::read_to_string(fx.config.install_root.join(RECEIPT_FILE)).unwrap();
        assert!(!receipt_body.contains("S3cret!"));
        assert_eq!(InstallReceipt::read(&fx.config.install_root).unwrap(), receipt);

        assert!(prompter.transcript.iter().any(|l| l.contains("https://example.com")));
        assert!(prompter.transcript.iter().all(|l| !l.contains("S3cret!")));
    }

    #[tokio::test]
    async fn second_run_backs_up_and_keeps_one_site() {
        let fx = Fixture::new();
        let unit_path = fx.config.systemd_dir.join("lightstack-ui.service");
        let site_path = fx.config.nginx_dir.join("sites-available/lightstack-ui");
        let without_key = |unit: &str| {
            unit.lines()
                .filter(|l| !l.contains("JWT_SECRET_KEY="))
                .collect::<Vec<_>>()
                .join("\n")
        };

        fx.orchestrator().run(&mut answers("s")).await.unwrap();
        assert!(fx.backups().is_empty());
        let first_unit = fs::read_to_string(&unit_path).unwrap();
        let first_site = fs::read(&site_path).unwrap();

        let Outcome::Completed(receipt) = fx.orchestrator().run(&mut answers("s")).await.unwrap() else {
            panic!("expected a completed run");
        };

        assert_eq!(fx.backups().len(), 1);
        let backup = receipt.backup.unwrap();
        assert!(backup.join("backend/main.py").exists());
        assert!(backup.join(RECEIPT_FILE).exists());

        let enabled: Vec<_> = fs::read_dir(fx.config.nginx_dir.join("sites-enabled"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(enabled.len(), 1);
        // The renewal timer is registered once and then left alone.
        assert_eq!(fx.scripted.count("systemctl enable --now lightstack-certbot-renew.timer"), 1);

        // Only the freshly generated key differs between the two units.
        let second_unit = fs::read_to_string(&unit_path).unwrap();
        assert_ne!(first_unit, second_unit);
        assert_eq!(without_key(&first_unit), without_key(&second_unit));
        assert_eq!(fs::read(&site_path).unwrap(), first_site);

        // A ready host never reaches the package manager.
        assert!(!fx.scripted.ran("apt-get"));
        assert!(!fx.scripted.ran("curl"));
    }

    #[tokio::test]
    async fn certificate_failure_aborts_before_services_start() {
        let fx = Fixture::new();
        fx.scripted.fail("certbot", "too many certificates already issued");
        let mut orch = fx.orchestrator();

        let err = orch.run(&mut answers("s")).await.unwrap_err();

        assert!(matches!(err, ProvisionError::CertificateIssuance(_)));
        assert_eq!(orch.stage(), Stage::Aborted);
        assert!(!fx.scripted.ran("systemctl restart"));
        assert!(!fx.config.install_root.join(RECEIPT_FILE).exists());
    }

    #[tokio::test]
    async fn inactive_service_after_start_is_an_error() {
        let fx = Fixture::new();
        fx.scripted.fail("systemctl is-active", "");
        let mut orch = fx.orchestrator();

        let err = orch.run(&mut answers("s")).await.unwrap_err();

        assert!(matches!(err, ProvisionError::Service(ref m) if m.contains("journalctl")));
        assert_eq!(orch.stage(), Stage::Aborted);
    }
}
