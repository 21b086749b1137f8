use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::sys::traits::{
    CertificateIssuer, CertificateRequest, CommandRunner, CommandSpec, JobIntent, JobScheduler,
    ProxyManager,
};

/// Renewal runs daily at noon; certbot itself skips certificates that are not
/// close to expiry.
pub const RENEWAL_SCHEDULE: &str = "*-*-* 12:00:00";
pub const RENEWAL_JOB_NAME: &str = "lightstack-certbot-renew";

// ==============================================================================
// 1. Concrete Implementation (certbot + nginx plugin)
// ==============================================================================

pub struct CertbotIssuer {
    runner: Arc<dyn CommandRunner>,
}

impl CertbotIssuer {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl CertificateIssuer for CertbotIssuer {
    async fn issue(&self, request: &CertificateRequest) -> Result<()> {
        // `--redirect` makes certbot rewrite the live site: 443 listener,
        // certificate paths, and a 301 from port 80.
        let spec = CommandSpec::new("certbot").args([
            "--nginx",
            "--non-interactive",
            "--agree-tos",
            "--email",
            request.email.as_str(),
            "-d",
            request.domain.as_str(),
            "--redirect",
        ]);

        self.runner
            .run_checked(&spec)
            .await
            .map(|_| ())
            .map_err(|e| ProvisionError::CertificateIssuance(e.to_string()))
    }
}

pub fn renewal_job() -> JobIntent {
    JobIntent {
        name: RENEWAL_JOB_NAME.to_string(),
        description: "Renew Lightstack UI TLS certificates".to_string(),
        binary: "/usr/bin/certbot".to_string(),
        args: vec![
            "renew".into(),
            "--quiet".into(),
            "--deploy-hook".into(),
            "systemctl reload nginx".into(),
        ],
        schedule: RENEWAL_SCHEDULE.to_string(),
    }
}

// ==============================================================================
// 2. TLS step
// ==============================================================================

pub struct TlsProvisioner<'a> {
    proxy: &'a dyn ProxyManager,
    issuer: &'a dyn CertificateIssuer,
    scheduler: &'a dyn JobScheduler,
}

impl<'a> TlsProvisioner<'a> {
    pub fn new(
        proxy: &'a dyn ProxyManager,
        issuer: &'a dyn CertificateIssuer,
        scheduler: &'a dyn JobScheduler,
    ) -> Self {
        Self {
            proxy,
            issuer,
            scheduler,
        }
    }

    /// certbot edits the live site in place, so the site must already be
    /// active. 🛡️ This fails loudly instead of issuing against nothing.
    pub async fn provision(&self, site_name: &str, request: &CertificateRequest) -> Result<()> {
        if !self.proxy.is_site_active(site_name) {
            return Err(ProvisionError::ProxySiteInactive(self.proxy.enabled_path(site_name)));
        }

        info!(domain = %request.domain, "🔐 requesting certificate");
        self.issuer.issue(request).await?;

        if self.scheduler.ensure_job(&renewal_job()).await? {
            info!(job = RENEWAL_JOB_NAME, "⏰ renewal timer registered");
        } else {
            info!(job = RENEWAL_JOB_NAME, "renewal timer already in place");
        }
        Ok(())
    }
}
