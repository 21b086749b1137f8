use async_trait::async_trait;
use std::fmt::Write as _;
use std::fs as std_fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::error::{ProvisionError, Result};
use crate::sys::traits::{CommandRunner, CommandSpec, ProxyManager};

/// Name of the placeholder site shipped by the nginx package.
const DEFAULT_SITE: &str = "default";

/// 🛡️ Strictly validates domain names to prevent config injection.
pub fn validate_domain_format(domain: &str) -> Result<()> {
    let invalid = || ProvisionError::InvalidDomain(domain.to_string());

    if domain.is_empty() || domain.len() > 253 {
        return Err(invalid());
    }
    // Alphanumerics and hyphens per label; everything else (spaces, quotes,
    // braces, semicolons, slashes) could break out of `server_name`.
    for label in domain.split('.') {
        if label.is_empty()
            || label.len() > 63
            || label.starts_with('-')
            || label.ends_with('-')
            || !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid());
        }
    }
    Ok(())
}

// ==============================================================================
// 1. Site Descriptor
// ==============================================================================

/// One path-prefix reverse-proxy rule.
#[derive(Clone, Debug)]
pub struct ProxyRoute {
    pub prefix: String,
    pub upstream: String,
    pub headers: Vec<(String, String)>,
}

impl ProxyRoute {
    /// Forwards `prefix` to a loopback port with WebSocket upgrade and the
    /// usual client/host/scheme headers.
    pub fn loopback(prefix: &str, port: u16) -> Self {
        let headers = [
            ("Upgrade", "$http_upgrade"),
            ("Connection", "'upgrade'"),
            ("Host", "$host"),
            ("X-Real-IP", "$remote_addr"),
            ("X-Forwarded-For", "$proxy_add_x_forwarded_for"),
            ("X-Forwarded-Proto", "$scheme"),
        ];
        Self {
            prefix: prefix.to_string(),
            // Trailing slash strips the prefix before it reaches the backend.
            upstream: format!("http://127.0.0.1:{port}/"),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SiteDescriptor {
    pub name: String,
    pub listen_port: u16,
    pub server_name: String,
    pub static_root: PathBuf,
    pub routes: Vec<ProxyRoute>,
}

impl SiteDescriptor {
    /// HTTP site serving the SPA build with `/api/` forwarded to the backend.
    pub fn spa_with_api(name: &str, domain: &str, static_root: &Path, backend_port: u16) -> Self {
        Self {
            name: name.to_string(),
            listen_port: 80,
            server_name: domain.to_string(),
            static_root: static_root.to_path_buf(),
            routes: vec![ProxyRoute::loopback("/api/", backend_port)],
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "server {{");
        let _ = writeln!(out, "    listen {};", self.listen_port);
        let _ = writeln!(out, "    server_name {};", self.server_name);
        let _ = writeln!(out);
        let _ = writeln!(out, "    root {};", self.static_root.display());
        let _ = writeln!(out, "    index index.html;");
        let _ = writeln!(out);
        let _ = writeln!(out, "    location / {{");
        let _ = writeln!(out, "        try_files $uri $uri/ /index.html;");
        let _ = writeln!(out, "    }}");

        for route in &self.routes {
            let _ = writeln!(out);
            let _ = writeln!(out, "    location {} {{", route.prefix);
            let _ = writeln!(out, "        proxy_pass {};", route.upstream);
            let _ = writeln!(out, "        proxy_http_version 1.1;");
            for (name, value) in &route.headers {
                let _ = writeln!(out, "        proxy_set_header {name} {value};");
            }
            let _ = writeln!(out, "        proxy_cache_bypass $http_upgrade;");
            let _ = writeln!(out, "    }}");
        }

        let _ = writeln!(out, "}}");
        out
    }
}

// ==============================================================================
// 2. Nginx Implementation
// ==============================================================================

pub struct NginxManager {
    base_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl NginxManager {
    pub fn new(base_path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            base_path: base_path.into(),
            runner,
        }
    }

    pub fn available_path(&self, site: &str) -> PathBuf {
        self.base_path.join("sites-available").join(site)
    }

    async fn config_test(&self) -> Result<()> {
        let check = self.runner.run(&CommandSpec::new("nginx").arg("-t")).await?;
        if !check.success() {
            return Err(ProvisionError::ProxyConfigInvalid(check.stderr.trim().to_string()));
        }
        Ok(())
    }
}

/// What was on disk before this run touched the site, so a rejected config
/// can be put back exactly.
struct PriorState {
    content: Option<Vec<u8>>,
    link_target: Option<PathBuf>,
}

#[async_trait]
impl ProxyManager for NginxManager {
    async fn activate_site(&self, site: &SiteDescriptor) -> Result<PathBuf> {
        validate_domain_format(&site.server_name)?;

        let config_path = self.available_path(&site.name);
        let enabled_link = self.enabled_path(&site.name);
        for dir in [config_path.parent(), enabled_link.parent()].into_iter().flatten() {
            fs::create_dir_all(dir).await.map_err(ProvisionError::fs(dir))?;
        }

        let prior = PriorState {
            content: fs::read(&config_path).await.ok(),
            link_target: fs::read_link(&enabled_link).await.ok(),
        };

        fs::write(&config_path, site.render())
            .await
            .map_err(ProvisionError::fs(&config_path))?;
        if prior.link_target.as_deref() != Some(config_path.as_path()) {
            if fs::symlink_metadata(&enabled_link).await.is_ok() {
                fs::remove_file(&enabled_link)
                    .await
                    .map_err(ProvisionError::fs(&enabled_link))?;
            }
            fs::symlink(&config_path, &enabled_link)
                .await
                .map_err(ProvisionError::fs(&enabled_link))?;
        }

        // 🛡️ Never reload a config nginx itself rejects; put the old one back.
        if let Err(e) = self.config_test().await {
            warn!(site = %site.name, "nginx rejected the generated site, restoring previous state");
            restore(&config_path, &enabled_link, &prior).await?;
            return Err(e);
        }

        let default_link = self.enabled_path(DEFAULT_SITE);
        if fs::symlink_metadata(&default_link).await.is_ok() {
            fs::remove_file(&default_link)
                .await
                .map_err(ProvisionError::fs(&default_link))?;
            info!("removed nginx default site");
        }

        self.reload().await?;
        info!(site = %site.name, domain = %site.server_name, "🌐 nginx site active");
        Ok(enabled_link)
    }

    async fn reload(&self) -> Result<()> {
        self.runner
            .run_checked(&CommandSpec::new("systemctl").args(["reload", "nginx"]))
            .await
            .map(|_| ())
    }

    fn enabled_path(&self, site: &str) -> PathBuf {
        self.base_path.join("sites-enabled").join(site)
    }

    /// True when the enabled link exists and resolves to the available file.
    fn is_site_active(&self, site: &str) -> bool {
        let link = self.enabled_path(site);
        match (std_fs::canonicalize(&link), std_fs::canonicalize(self.available_path(site))) {
            (Ok(target), Ok(expected)) => target == expected,
            _ => false,
        }
    }
}

async fn restore(config_path: &Path, enabled_link: &Path, prior: &PriorState) -> Result<()> {
    match &prior.content {
        Some(bytes) => fs::write(config_path, bytes)
            .await
            .map_err(ProvisionError::fs(config_path))?,
        None => fs::remove_file(config_path)
            .await
            .map_err(ProvisionError::fs(config_path))?,
    }

    if fs::symlink_metadata(enabled_link).await.is_ok() {
        fs::remove_file(enabled_link)
            .await
            .map_err(ProvisionError::fs(enabled_link))?;
    }
    if let Some(target) = &prior.link_target {
        fs::symlink(target, enabled_link)
            .await
            .map_err(ProvisionError::fs(enabled_link))?;
    }
    Ok(())
}
