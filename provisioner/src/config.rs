// provisioner/src/config.rs

use std::env;
use std::path::PathBuf;

use crate::error::{ProvisionError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct ProvisionConfig {
    // 📂 Install layout
    pub install_root: PathBuf,
    pub source_dir: PathBuf,

    // 📂 Host integration paths
    pub systemd_dir: PathBuf,
    pub nginx_dir: PathBuf,

    // ⚙️ Stack identity
    pub service_name: String,
    pub site_name: String,
    pub backend_port: u16,
    pub node_major: u32,

    pub log_format: LogFormat,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("/opt/lightstack-ui"),
            source_dir: PathBuf::from("ui"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            nginx_dir: PathBuf::from("/etc/nginx"),
            service_name: "lightstack-ui".to_string(),
            site_name: "lightstack-ui".to_string(),
            backend_port: 8000,
            node_major: 20,
            log_format: LogFormat::Text,
        }
    }
}

impl ProvisionConfig {
    /// Reads `LIGHTSTACK_*` overrides from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests never touch the
    /// real process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // 🛡️ Numeric values are parsed strictly. A typo refuses to start
        // instead of silently binding the backend somewhere unexpected.
        let backend_port = match get("LIGHTSTACK_BACKEND_PORT") {
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(0) | Err(_) => {
                    return Err(ProvisionError::Config(format!(
                        "LIGHTSTACK_BACKEND_PORT must be a port between 1 and 65535, got '{raw}'"
                    )));
                }
                Ok(port) => port,
            },
            None => defaults.backend_port,
        };

        let node_major = match get("LIGHTSTACK_NODE_MAJOR") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                ProvisionError::Config(format!(
                    "LIGHTSTACK_NODE_MAJOR must be a major version number, got '{raw}'"
                ))
            })?,
            None => defaults.node_major,
        };

        let log_format = match get("LIGHTSTACK_LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ProvisionError::Config(format!(
                    "LIGHTSTACK_LOG_FORMAT must be 'text' or 'json', got '{other}'"
                )));
            }
        };

        Ok(Self {
            install_root: get("LIGHTSTACK_INSTALL_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.install_root),
            source_dir: get("LIGHTSTACK_SOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.source_dir),
            systemd_dir: get("LIGHTSTACK_SYSTEMD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.systemd_dir),
            nginx_dir: get("LIGHTSTACK_NGINX_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.nginx_dir),
            service_name: get("LIGHTSTACK_SERVICE_NAME").unwrap_or(defaults.service_name),
            site_name: get("LIGHTSTACK_SITE_NAME").unwrap_or(defaults.site_name),
            backend_port,
            node_major,
            log_format,
        })
    }

    pub fn backend_dir(&self) -> PathBuf {
        self.install_root.join("backend")
    }

    pub fn frontend_dir(&self) -> PathBuf {
        self.install_root.join("frontend")
    }

    /// Where `npm run build` leaves the static asset tree.
    pub fn static_root(&self) -> PathBuf {
        self.frontend_dir().join("dist")
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.backend_dir().join("venv")
    }

    pub fn unit_file_name(&self) -> String {
        format!("{}.service", self.service_name)
    }
}
