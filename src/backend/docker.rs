//! Docker container-engine backend.
//!
//! Drives the `docker` CLI through the serialized runner. The backend is
//! stateless: every `list` reconstructs deployments from containers bearing
//! the platform label set. On first deployment the shared bridge network is
//! created, with its subnet chosen by the allocator in `network`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::backend::network::{allocate_subnet, parse_existing, resolve_supernets};
use crate::backend::runner::CliRunner;
use crate::backend::{
    BackendKind, DeployRequest, Deployment, DeploymentFilter, DeploymentStatus, ExecSpec,
    LogOptions, LogStream, PortMapping, LABEL_CONFIG, LABEL_CREATED_AT, LABEL_DEPLOYMENT_ID,
    LABEL_MANAGED_BY, LABEL_TEMPLATE, LABEL_TRANSPORT, MANAGED_BY_VALUE,
};
use crate::error::StevedoreError;
use crate::template::Transport;

/// Wall-clock bound per docker CLI invocation; image pulls dominate.
const DOCKER_TIMEOUT: Duration = Duration::from_secs(120);

pub struct DockerBackend {
    runner: CliRunner,
    network_name: String,
    subnet_override: Option<String>,
    /// Resolved shared network name, created at most once per process.
    network_ready: OnceCell<String>,
}

impl DockerBackend {
    pub fn new(network_name: impl Into<String>, subnet_override: Option<String>) -> Self {
        Self {
            runner: CliRunner::new("docker", DOCKER_TIMEOUT),
            network_name: network_name.into(),
            subnet_override,
            network_ready: OnceCell::new(),
        }
    }

    /// Ensure the shared bridge network exists, allocating a free /24 for it.
    async fn ensure_network(&self) -> crate::Result<String> {
        self.network_ready
            .get_or_try_init(|| async {
                let names = self
                    .runner
                    .run(&["network", "ls", "--format", "{{.Name}}"])
                    .await?;
                if !names.success() {
                    return Err(map_runtime_error("network ls", &names.stderr));
                }
                if names.stdout.lines().any(|n| n.trim() == self.network_name) {
                    return Ok(self.network_name.clone());
                }

                let existing = self.existing_subnets().await?;
                let supernets = resolve_supernets(self.subnet_override.as_deref(), &existing);

                let mut args: Vec<String> =
                    vec!["network".into(), "create".into(), "--driver".into(), "bridge".into()];
                match allocate_subnet(&existing, &supernets) {
                    Some(subnet) => {
                        tracing::info!(network = %self.network_name, %subnet, "creating container network");
                        args.push("--subnet".into());
                        args.push(subnet.to_string());
                    }
                    None => {
                        // Every pool is occupied; let the daemon pick rather than fail.
                        tracing::warn!(
                            network = %self.network_name,
                            "subnet pools exhausted, creating network without explicit IPAM"
                        );
                    }
                }
                args.push(self.network_name.clone());
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                let created = self.runner.run(&arg_refs).await?;
                if !created.success() {
                    return Err(StevedoreError::NetworkAllocation(created.stderr.trim().to_string()));
                }
                Ok(self.network_name.clone())
            })
            .await
            .map(|name| name.clone())
    }

    /// Subnets of every network currently on the host, canonicalized.
    async fn existing_subnets(&self) -> crate::Result<Vec<ipnetwork::Ipv4Network>> {
        let ids = self.runner.run(&["network", "ls", "-q"]).await?;
        if !ids.success() {
            return Err(map_runtime_error("network ls", &ids.stderr));
        }
        let id_list: Vec<&str> = ids.stdout.split_whitespace().collect();
        if id_list.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec![
            "network",
            "inspect",
            "--format",
            r#"{{range .IPAM.Config}}{{.Subnet}}{{"\n"}}{{end}}"#,
        ];
        args.extend(&id_list);
        let inspected = self.runner.run(&args).await?;
        if !inspected.success() {
            return Err(map_runtime_error("network inspect", &inspected.stderr));
        }
        Ok(parse_existing(inspected.stdout.lines()))
    }

    pub async fn deploy(&self, mut request: DeployRequest) -> crate::Result<Deployment> {
        let network = match request.network {
            Some(ref name) => name.clone(),
            None => self.ensure_network().await?,
        };
        let deployment_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let container_name = format!("{}-{}", request.name_hint, name_suffix());
        request
            .env
            .insert("MCP_DEPLOYMENT_ID".to_string(), deployment_id.clone());

        let mut labels = platform_labels(&request, &deployment_id, created_at);
        labels.extend(request.labels.clone());

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            container_name.clone(),
            "--network".into(),
            network.clone(),
        ];
        for (key, value) in &labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &request.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for mount in &request.mounts {
            args.push("-v".into());
            args.push(format!("{}:{}", mount.host, mount.container));
        }
        if let Some(port) = request.port {
            args.push("-p".into());
            args.push(publish_arg(port));
        }
        args.push(request.image.clone());
        args.extend(request.args.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.runner.run(&arg_refs).await?;
        if !output.success() {
            return Err(map_deploy_error(&request, &output.stderr));
        }

        // Read back ports and state; docker assigns ephemeral host ports.
        let entries = self.inspect(&[container_name.as_str()]).await?;
        let entry = entries.into_iter().next().ok_or_else(|| {
            StevedoreError::Deployment(
                request.template_id.clone(),
                "container vanished after create".to_string(),
            )
        })?;
        deployment_from_inspect(&entry).ok_or_else(|| {
            StevedoreError::Deployment(
                request.template_id.clone(),
                "created container is missing platform labels".to_string(),
            )
        })
    }

    pub async fn stop(&self, deployment_id: &str, timeout: Duration) -> crate::Result<()> {
        let Some(container) = self.resolve_container(deployment_id).await? else {
            tracing::debug!(deployment = %deployment_id, "stop on absent deployment is a no-op");
            return Ok(());
        };
        let secs = timeout.as_secs().max(1).to_string();
        let stopped = self
            .runner
            .run(&["stop", "-t", &secs, &container])
            .await?;
        if !stopped.success() && !is_not_found(&stopped.stderr) {
            return Err(map_runtime_error(deployment_id, &stopped.stderr));
        }
        let removed = self.runner.run(&["rm", "-f", &container]).await?;
        if !removed.success() && !is_not_found(&removed.stderr) {
            return Err(map_runtime_error(deployment_id, &removed.stderr));
        }
        Ok(())
    }

    pub async fn list(&self, filter: &DeploymentFilter) -> crate::Result<Vec<Deployment>> {
        let managed = format!("label={}={}", LABEL_MANAGED_BY, MANAGED_BY_VALUE);
        let mut args = vec!["ps", "-aq", "--filter", &managed];
        let template_filter;
        if let Some(ref template_id) = filter.template_id {
            template_filter = format!("label={}={}", LABEL_TEMPLATE, template_id);
            args.push("--filter");
            args.push(&template_filter);
        }
        let ids = self.runner.run(&args).await?;
        if !ids.success() {
            return Err(map_runtime_error("ps", &ids.stderr));
        }
        let id_list: Vec<&str> = ids.stdout.split_whitespace().collect();
        if id_list.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.inspect(&id_list).await?;
        let mut deployments: Vec<Deployment> = entries
            .iter()
            .filter_map(deployment_from_inspect)
            .filter(|d| {
                filter.include_stopped
                    || !matches!(d.status, DeploymentStatus::Stopped | DeploymentStatus::Failed)
            })
            .collect();
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deployments)
    }

    pub async fn logs(
        &self,
        deployment_id: &str,
        options: LogOptions,
    ) -> crate::Result<LogStream> {
        let container = self
            .resolve_container(deployment_id)
            .await?
            .ok_or_else(|| StevedoreError::DeploymentNotFound(deployment_id.to_string()))?;
        let mut args: Vec<String> = vec!["logs".into()];
        if let Some(tail) = options.tail {
            args.push("--tail".into());
            args.push(tail.to_string());
        }
        if options.follow {
            args.push("--follow".into());
        }
        args.push(container);
        self.runner
            .spawn_streaming(args, BTreeMap::new(), CancellationToken::new())
    }

    pub async fn exec(
        &self,
        deployment_id: &str,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> crate::Result<Vec<u8>> {
        let container = self
            .resolve_container(deployment_id)
            .await?
            .ok_or_else(|| StevedoreError::DeploymentNotFound(deployment_id.to_string()))?;
        let mut args: Vec<String> = vec!["exec".into(), "-i".into(), container];
        args.extend(argv);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .runner
            .run_with_stdin(&arg_refs, stdin.as_deref())
            .await?;
        if !output.success() {
            return Err(map_runtime_error(deployment_id, &output.stderr));
        }
        Ok(output.stdout.into_bytes())
    }

    /// `docker run -i --rm` spec for an ephemeral stdio session.
    pub fn stdio_exec_spec(&self, request: &DeployRequest) -> ExecSpec {
        let mut args: Vec<String> = vec!["run".into(), "-i".into(), "--rm".into()];
        for (key, value) in &request.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for mount in &request.mounts {
            args.push("-v".into());
            args.push(format!("{}:{}", mount.host, mount.container));
        }
        args.push(request.image.clone());
        args.extend(request.args.iter().cloned());
        ExecSpec {
            program: "docker".to_string(),
            args,
            env: BTreeMap::new(),
        }
    }

    /// Map a deployment id to its container id via the identity label.
    async fn resolve_container(&self, deployment_id: &str) -> crate::Result<Option<String>> {
        let label = format!("label={}={}", LABEL_DEPLOYMENT_ID, deployment_id);
        let output = self.runner.run(&["ps", "-aq", "--filter", &label]).await?;
        if !output.success() {
            return Err(map_runtime_error(deployment_id, &output.stderr));
        }
        Ok(output
            .stdout
            .split_whitespace()
            .next()
            .map(str::to_string))
    }

    async fn inspect(&self, ids: &[&str]) -> crate::Result<Vec<InspectEntry>> {
        let mut args = vec!["inspect"];
        args.extend(ids);
        let output = self.runner.run(&args).await?;
        if !output.success() {
            return Err(map_runtime_error("inspect", &output.stderr));
        }
        parse_inspect(&output.stdout)
    }
}

/// Random lowercase suffix for readable container names; uniqueness comes
/// from the deployment-id label, not the name.
fn name_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Platform-owned labels for one deployment.
fn platform_labels(
    request: &DeployRequest,
    deployment_id: &str,
    created_at: DateTime<Utc>,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TEMPLATE.to_string(), request.template_id.clone()),
        (LABEL_DEPLOYMENT_ID.to_string(), deployment_id.to_string()),
        (LABEL_CREATED_AT.to_string(), created_at.to_rfc3339()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (LABEL_TRANSPORT.to_string(), request.transport.to_string()),
    ])
}

/// Publish argument for one port mapping; host 0 asks docker for an
/// ephemeral host port.
fn publish_arg(port: PortMapping) -> String {
    if port.host == 0 {
        format!("127.0.0.1::{}", port.container)
    } else {
        format!("127.0.0.1:{}:{}", port.host, port.container)
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Classify docker stderr into the platform error taxonomy.
fn map_runtime_error(context: &str, stderr: &str) -> StevedoreError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
    {
        StevedoreError::BackendUnavailable("docker".to_string(), message)
    } else if is_not_found(stderr) {
        StevedoreError::DeploymentNotFound(context.to_string())
    } else {
        StevedoreError::Deployment(context.to_string(), message)
    }
}

fn map_deploy_error(request: &DeployRequest, stderr: &str) -> StevedoreError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("pull access denied")
        || lower.contains("manifest unknown")
        || lower.contains("no such image")
        || lower.contains("not found: manifest")
    {
        StevedoreError::ImagePull(request.image.clone(), message)
    } else if lower.contains("port is already allocated") || lower.contains("address already in use")
    {
        let port = request
            .port
            .map(|p| p.host.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        StevedoreError::PortBind(port, message)
    } else {
        map_runtime_error(&request.template_id, stderr)
    }
}

// --- docker inspect parsing -------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    #[allow(dead_code)]
    id: String,
    created: String,
    state: InspectState,
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectPortBinding>>>>,
    #[serde(default)]
    networks: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPortBinding {
    #[serde(default)]
    #[allow(dead_code)]
    host_ip: Option<String>,
    host_port: String,
}

fn parse_inspect(raw: &str) -> crate::Result<Vec<InspectEntry>> {
    serde_json::from_str(raw)
        .map_err(|e| StevedoreError::Deployment("inspect".to_string(), e.to_string()))
}

fn container_status(status: &str) -> DeploymentStatus {
    match status {
        "running" => DeploymentStatus::Running,
        "created" | "restarting" => DeploymentStatus::Pending,
        "paused" | "exited" => DeploymentStatus::Stopped,
        "dead" => DeploymentStatus::Failed,
        _ => DeploymentStatus::Failed,
    }
}

/// Rebuild a `Deployment` from an inspect entry. Containers without the
/// platform label set are not ours and yield `None`.
fn deployment_from_inspect(entry: &InspectEntry) -> Option<Deployment> {
    let labels: BTreeMap<String, String> = entry
        .config
        .labels
        .as_ref()?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if labels.get(LABEL_MANAGED_BY).map(String::as_str) != Some(MANAGED_BY_VALUE) {
        return None;
    }
    let deployment_id = labels.get(LABEL_DEPLOYMENT_ID)?.clone();
    let template_id = labels.get(LABEL_TEMPLATE)?.clone();
    let transport = match labels.get(LABEL_TRANSPORT).map(String::as_str) {
        Some("stdio") => Transport::Stdio,
        _ => Transport::Http,
    };

    let created_at = DateTime::parse_from_rfc3339(&entry.created)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| {
            labels
                .get(LABEL_CREATED_AT)
                .map(String::as_str)
                .unwrap_or("")
                .parse::<DateTime<Utc>>()
        })
        .unwrap_or_else(|_| Utc::now());

    let mut ports = Vec::new();
    if let Some(ref port_map) = entry.network_settings.ports {
        for (spec, bindings) in port_map {
            let container: u16 = match spec.split('/').next().and_then(|p| p.parse().ok()) {
                Some(p) => p,
                None => continue,
            };
            if let Some(bindings) = bindings {
                for binding in bindings {
                    if let Ok(host) = binding.host_port.parse::<u16>() {
                        ports.push(PortMapping { host, container });
                    }
                }
            }
        }
    }
    ports.sort_by_key(|p| (p.container, p.host));

    let network = entry
        .network_settings
        .networks
        .as_ref()
        .and_then(|n| n.keys().next().cloned());

    let config = labels
        .get(LABEL_CONFIG)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(serde_json::Value::Null);

    Some(Deployment {
        deployment_id,
        template_id,
        status: container_status(&entry.state.status),
        backend: BackendKind::Docker,
        transport,
        network,
        ports,
        created_at,
        labels,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INSPECT: &str = r#"[
      {
        "Id": "0123456789abcdef",
        "Created": "2025-07-01T12:00:00.123456789Z",
        "State": {"Status": "running"},
        "Config": {
          "Labels": {
            "mcp.template": "demo",
            "mcp.deployment_id": "dep-1111",
            "mcp.created_at": "2025-07-01T12:00:00+00:00",
            "mcp.managed_by": "mcp-platform",
            "mcp.transport": "http",
            "mcp.config_hash": "cafe",
            "mcp.config": "{\"hello_from\":\"X\"}"
          }
        },
        "NetworkSettings": {
          "Ports": {"8080/tcp": [{"HostIp": "127.0.0.1", "HostPort": "32768"}]},
          "Networks": {"stevedore-mcp": {}}
        }
      }
    ]"#;

    #[test]
    fn test_parse_inspect_and_rebuild_deployment() {
        let entries = parse_inspect(SAMPLE_INSPECT).unwrap();
        let deployment = deployment_from_inspect(&entries[0]).unwrap();
        assert_eq!(deployment.deployment_id, "dep-1111");
        assert_eq!(deployment.template_id, "demo");
        assert_eq!(deployment.status, DeploymentStatus::Running);
        assert_eq!(deployment.transport, Transport::Http);
        assert_eq!(
            deployment.ports,
            vec![PortMapping {
                host: 32768,
                container: 8080
            }]
        );
        assert_eq!(deployment.network.as_deref(), Some("stevedore-mcp"));
        assert_eq!(deployment.config["hello_from"], "X");
        assert_eq!(deployment.config_hash(), Some("cafe"));
    }

    #[test]
    fn test_unmanaged_container_ignored() {
        let raw = SAMPLE_INSPECT.replace("mcp-platform", "someone-else");
        let entries = parse_inspect(&raw).unwrap();
        assert!(deployment_from_inspect(&entries[0]).is_none());
    }

    #[test]
    fn test_container_status_mapping() {
        assert_eq!(container_status("running"), DeploymentStatus::Running);
        assert_eq!(container_status("created"), DeploymentStatus::Pending);
        assert_eq!(container_status("exited"), DeploymentStatus::Stopped);
        assert_eq!(container_status("dead"), DeploymentStatus::Failed);
    }

    #[test]
    fn test_publish_arg_forms() {
        assert_eq!(
            publish_arg(PortMapping {
                host: 8081,
                container: 8080
            }),
            "127.0.0.1:8081:8080"
        );
        assert_eq!(
            publish_arg(PortMapping {
                host: 0,
                container: 8080
            }),
            "127.0.0.1::8080"
        );
    }

    #[test]
    fn test_error_classification() {
        let request = DeployRequest {
            template_id: "demo".into(),
            image: "example/demo".into(),
            name_hint: "demo".into(),
            transport: Transport::Http,
            env: BTreeMap::new(),
            mounts: vec![],
            args: vec![],
            network: None,
            port: Some(PortMapping {
                host: 8080,
                container: 8080,
            }),
            labels: BTreeMap::new(),
        };
        assert!(matches!(
            map_deploy_error(&request, "Error: pull access denied for example/demo"),
            StevedoreError::ImagePull(image, _) if image == "example/demo"
        ));
        assert!(matches!(
            map_deploy_error(&request, "Bind for 0.0.0.0:8080 failed: port is already allocated"),
            StevedoreError::PortBind(port, _) if port == "8080"
        ));
        assert!(matches!(
            map_runtime_error("x", "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            StevedoreError::BackendUnavailable(..)
        ));
        assert!(matches!(
            map_runtime_error("dep-1", "Error: No such container: abc"),
            StevedoreError::DeploymentNotFound(_)
        ));
    }

    #[test]
    fn test_stdio_exec_spec_has_rm_semantics() {
        let backend = DockerBackend::new("stevedore-mcp", None);
        let request = DeployRequest {
            template_id: "demo".into(),
            image: "example/demo:1".into(),
            name_hint: "demo".into(),
            transport: Transport::Stdio,
            env: BTreeMap::from([("HELLO_FROM".to_string(), "X".to_string())]),
            mounts: vec![],
            args: vec!["--verbose".into()],
            network: None,
            port: None,
            labels: BTreeMap::new(),
        };
        let spec = backend.stdio_exec_spec(&request);
        assert_eq!(spec.program, "docker");
        assert_eq!(spec.args[..3], ["run", "-i", "--rm"]);
        assert!(spec.args.contains(&"HELLO_FROM=X".to_string()));
        assert_eq!(spec.args.last().unwrap(), "--verbose");
        let image_pos = spec.args.iter().position(|a| a == "example/demo:1").unwrap();
        assert!(image_pos < spec.args.len() - 1);
    }

    #[test]
    fn test_name_suffix_is_lowercase_alnum() {
        let suffix = name_suffix();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
