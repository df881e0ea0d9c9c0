//! Platform settings — `stevedore.toml` plus environment overrides.
//!
//! The file supplies the durable configuration; a fixed set of environment
//! variables (`MCP_SUBNET`, `MCP_LOG_LEVEL`, `GATEWAY_*`) overrides it at
//! startup. `GATEWAY_DATABASE_URL` is recognized but rejected: the gateway
//! registry is file-backed and the relational backend is out of scope.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::backend::BackendKind;
use crate::error::StevedoreError;
use crate::gateway::AuthMode;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root of user-created templates.
    #[serde(default = "default_template_root")]
    pub template_root: PathBuf,
    /// Optional root of templates shipped with the platform.
    #[serde(default)]
    pub builtin_template_root: Option<PathBuf>,
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Shared bridge network for container-engine deployments.
    #[serde(default = "default_network_name")]
    pub network_name: String,
    /// Preferred supernet override, same as `MCP_SUBNET`.
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_registry_file")]
    pub registry_file: PathBuf,
    /// Bearer tokens; non-empty selects bearer auth.
    #[serde(default)]
    pub auth_tokens: Vec<String>,
    /// API keys; non-empty (and no tokens) selects API-key auth.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_template_root() -> PathBuf {
    PathBuf::from("templates")
}

fn default_backend() -> String {
    "docker".to_string()
}

fn default_network_name() -> String {
    "stevedore-mcp".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_workers() -> usize {
    4
}

fn default_registry_file() -> PathBuf {
    PathBuf::from("gateway-registry.json")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            template_root: default_template_root(),
            builtin_template_root: None,
            backend: default_backend(),
            network_name: default_network_name(),
            subnet: None,
            log_level: None,
            gateway: GatewaySettings::default(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            registry_file: default_registry_file(),
            auth_tokens: Vec::new(),
            api_keys: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from a TOML file (missing file means defaults), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut settings = match path {
            Some(path) if path.is_file() => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    StevedoreError::InvalidConfiguration(
                        path.display().to_string(),
                        e.to_string(),
                    )
                })?;
                toml::from_str(&raw).map_err(|e| {
                    StevedoreError::InvalidConfiguration(
                        path.display().to_string(),
                        e.to_string(),
                    )
                })?
            }
            _ => Settings::default(),
        };
        settings.apply_env_from(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Overlay the documented environment variables.
    pub fn apply_env_from(
        &mut self,
        get: impl Fn(&str) -> Option<String>,
    ) -> crate::Result<()> {
        if let Some(subnet) = get("MCP_SUBNET") {
            self.subnet = Some(subnet);
        }
        if let Some(level) = get("MCP_LOG_LEVEL") {
            self.log_level = Some(level);
        }
        if let Some(host) = get("GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = get("GATEWAY_PORT") {
            self.gateway.port = port.parse().map_err(|_| {
                StevedoreError::InvalidConfiguration(
                    "GATEWAY_PORT".to_string(),
                    format!("expected integer, got '{}'", port),
                )
            })?;
        }
        if let Some(workers) = get("GATEWAY_WORKERS") {
            self.gateway.workers = workers.parse().map_err(|_| {
                StevedoreError::InvalidConfiguration(
                    "GATEWAY_WORKERS".to_string(),
                    format!("expected integer, got '{}'", workers),
                )
            })?;
        }
        if let Some(file) = get("GATEWAY_REGISTRY_FILE") {
            self.gateway.registry_file = PathBuf::from(file);
        }
        if get("GATEWAY_DATABASE_URL").is_some() {
            return Err(StevedoreError::Persistence(
                "relational registry persistence is not supported; use GATEWAY_REGISTRY_FILE"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn backend_kind(&self) -> crate::Result<BackendKind> {
        self.backend.parse()
    }

    /// Auth mode derived from configured credentials: bearer tokens win,
    /// then API keys, else open mode.
    pub fn auth_mode(&self) -> AuthMode {
        if !self.gateway.auth_tokens.is_empty() {
            AuthMode::Bearer {
                tokens: self.gateway.auth_tokens.iter().cloned().collect::<HashSet<_>>(),
            }
        } else if !self.gateway.api_keys.is_empty() {
            AuthMode::ApiKey {
                keys: self.gateway.api_keys.iter().cloned().collect::<HashSet<_>>(),
            }
        } else {
            AuthMode::Open
        }
    }
}
