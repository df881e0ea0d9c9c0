//! Backend abstraction — uniform deployment operations over heterogeneous
//! container runtimes.
//!
//! A `Backend` is a tagged variant over the concrete runtimes (Docker CLI,
//! kubectl, in-memory mock) exposing five operations: deploy, stop, list,
//! logs, exec. The backends are stateless across restarts: `list` recovers
//! deployments by querying the runtime for the platform-owned label set.

pub mod docker;
pub mod kubernetes;
pub mod mock;
pub mod network;
pub mod runner;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::VolumeMount;
use crate::error::StevedoreError;
use crate::template::Transport;

pub use docker::DockerBackend;
pub use kubernetes::KubernetesBackend;
pub use mock::MockBackend;
pub use runner::{CliOutput, CliRunner};

/// Labels stamped on every container the platform creates.
pub const LABEL_TEMPLATE: &str = "mcp.template";
pub const LABEL_DEPLOYMENT_ID: &str = "mcp.deployment_id";
pub const LABEL_CREATED_AT: &str = "mcp.created_at";
pub const LABEL_MANAGED_BY: &str = "mcp.managed_by";
pub const LABEL_CONFIG_HASH: &str = "mcp.config_hash";
pub const LABEL_CONFIG: &str = "mcp.config";
pub const LABEL_TRANSPORT: &str = "mcp.transport";
pub const MANAGED_BY_VALUE: &str = "mcp-platform";

/// Which container runtime realizes deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Docker,
    Kubernetes,
    Mock,
}

impl std::str::FromStr for BackendKind {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(Self::Docker),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "mock" => Ok(Self::Mock),
            other => Err(StevedoreError::BackendUnavailable(
                other.to_string(),
                "unknown backend (expected docker, kubernetes, or mock)".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Lifecycle state of one deployment as the backend reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Unhealthy,
    Stopped,
    Failed,
}

/// One host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// One realized instance of a template on a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Backend-assigned, opaque, globally unique.
    pub deployment_id: String,
    pub template_id: String,
    pub status: DeploymentStatus,
    pub backend: BackendKind,
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Resolved config snapshot, recovered from labels on `list`.
    #[serde(default)]
    pub config: Value,
}

impl Deployment {
    /// Hash of the resolved config, for idempotent-redeploy detection.
    pub fn config_hash(&self) -> Option<&str> {
        self.labels.get(LABEL_CONFIG_HASH).map(String::as_str)
    }

    /// HTTP endpoint of the deployed MCP server, when a host port is mapped.
    pub fn endpoint_url(&self) -> Option<String> {
        self.ports
            .first()
            .map(|p| format!("http://127.0.0.1:{}/mcp", p.host))
    }
}

/// Filter for `list`. The default returns active deployments only.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub template_id: Option<String>,
    pub include_stopped: bool,
}

/// Everything a backend needs to realize one deployment.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub template_id: String,
    pub image: String,
    /// Human-readable container name prefix; uniqueness comes from labels.
    pub name_hint: String,
    pub transport: Transport,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<VolumeMount>,
    pub args: Vec<String>,
    pub network: Option<String>,
    pub port: Option<PortMapping>,
    /// Extra labels beyond the platform-owned set (config hash, snapshot).
    pub labels: BTreeMap<String, String>,
}

/// Log retrieval options.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub tail: Option<u32>,
    pub follow: bool,
}

/// Stream of log lines from a deployment.
pub type LogStream = tokio::sync::mpsc::Receiver<String>;

/// Command spec for spawning a short-lived stdio MCP session.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Uniform operations over the concrete runtimes. Dispatch is by tagged
/// variant; selection happens by name at construction time.
pub enum Backend {
    Docker(DockerBackend),
    Kubernetes(KubernetesBackend),
    Mock(MockBackend),
}

impl Backend {
    /// Construct the backend selected by kind.
    pub fn new(kind: BackendKind, network_name: &str, subnet_override: Option<String>) -> Self {
        match kind {
            BackendKind::Docker => {
                Backend::Docker(DockerBackend::new(network_name, subnet_override))
            }
            BackendKind::Kubernetes => Backend::Kubernetes(KubernetesBackend::new()),
            BackendKind::Mock => Backend::Mock(MockBackend::new()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Docker(_) => BackendKind::Docker,
            Backend::Kubernetes(_) => BackendKind::Kubernetes,
            Backend::Mock(_) => BackendKind::Mock,
        }
    }

    /// Create and start a container for the request.
    pub async fn deploy(&self, request: DeployRequest) -> crate::Result<Deployment> {
        match self {
            Backend::Docker(b) => b.deploy(request).await,
            Backend::Kubernetes(b) => b.deploy(request).await,
            Backend::Mock(b) => b.deploy(request).await,
        }
    }

    /// Stop and remove a deployment. Idempotent on already-stopped ids.
    pub async fn stop(&self, deployment_id: &str, timeout: Duration) -> crate::Result<()> {
        match self {
            Backend::Docker(b) => b.stop(deployment_id, timeout).await,
            Backend::Kubernetes(b) => b.stop(deployment_id, timeout).await,
            Backend::Mock(b) => b.stop(deployment_id, timeout).await,
        }
    }

    /// Reconstruct deployments from runtime state by platform labels.
    pub async fn list(&self, filter: &DeploymentFilter) -> crate::Result<Vec<Deployment>> {
        match self {
            Backend::Docker(b) => b.list(filter).await,
            Backend::Kubernetes(b) => b.list(filter).await,
            Backend::Mock(b) => b.list(filter).await,
        }
    }

    /// Stream log lines from a deployment.
    pub async fn logs(&self, deployment_id: &str, options: LogOptions) -> crate::Result<LogStream> {
        match self {
            Backend::Docker(b) => b.logs(deployment_id, options).await,
            Backend::Kubernetes(b) => b.logs(deployment_id, options).await,
            Backend::Mock(b) => b.logs(deployment_id, options).await,
        }
    }

    /// Run a command inside a deployment and collect its output.
    pub async fn exec(
        &self,
        deployment_id: &str,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> crate::Result<Vec<u8>> {
        match self {
            Backend::Docker(b) => b.exec(deployment_id, argv, stdin).await,
            Backend::Kubernetes(b) => b.exec(deployment_id, argv, stdin).await,
            Backend::Mock(b) => b.exec(deployment_id, argv, stdin).await,
        }
    }

    /// Command spec for an ephemeral stdio session of the given image
    /// (`--rm` semantics; torn down when stdin closes).
    pub fn stdio_exec_spec(&self, request: &DeployRequest) -> ExecSpec {
        match self {
            Backend::Docker(b) => b.stdio_exec_spec(request),
            Backend::Kubernetes(b) => b.stdio_exec_spec(request),
            Backend::Mock(b) => b.stdio_exec_spec(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert_eq!(
            "k8s".parse::<BackendKind>().unwrap(),
            BackendKind::Kubernetes
        );
        assert_eq!("mock".parse::<BackendKind>().unwrap(), BackendKind::Mock);
        assert!("podman".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_endpoint_url_from_port_mapping() {
        let deployment = Deployment {
            deployment_id: "abc".into(),
            template_id: "demo".into(),
            status: DeploymentStatus::Running,
            backend: BackendKind::Mock,
            transport: Transport::Http,
            network: None,
            ports: vec![PortMapping {
                host: 32768,
                container: 8080,
            }],
            created_at: Utc::now(),
            labels: BTreeMap::new(),
            config: Value::Null,
        };
        assert_eq!(
            deployment.endpoint_url().unwrap(),
            "http://127.0.0.1:32768/mcp"
        );
    }
}
