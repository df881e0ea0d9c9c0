//! Kubernetes orchestrator backend.
//!
//! Drives `kubectl` through the serialized runner for cluster targets.
//! Deployments are realized as single pods carrying the platform label set;
//! timestamps and the config snapshot travel as annotations because
//! Kubernetes label values cannot hold RFC 3339 strings. `--labels` and
//! `--annotations` each take one comma-separated value, so both are passed
//! as a single flag; the config snapshot is JSON (commas inside) and is
//! applied through a follow-up `kubectl annotate` instead.
//!
//! Cluster networking is owned by the cluster CNI, so no subnet allocation
//! happens here and port mappings reflect the declared container port.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::backend::runner::CliRunner;
use crate::backend::{
    BackendKind, DeployRequest, Deployment, DeploymentFilter, DeploymentStatus, ExecSpec,
    LogOptions, LogStream, PortMapping, LABEL_CONFIG, LABEL_CONFIG_HASH, LABEL_CREATED_AT,
    LABEL_DEPLOYMENT_ID, LABEL_MANAGED_BY, LABEL_TEMPLATE, LABEL_TRANSPORT, MANAGED_BY_VALUE,
};
use crate::error::StevedoreError;
use crate::template::Transport;

const KUBECTL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct KubernetesBackend {
    runner: CliRunner,
}

impl Default for KubernetesBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KubernetesBackend {
    pub fn new() -> Self {
        Self {
            runner: CliRunner::new("kubectl", KUBECTL_TIMEOUT),
        }
    }

    pub async fn deploy(&self, mut request: DeployRequest) -> crate::Result<Deployment> {
        let deployment_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let pod_name = format!("{}-{}", request.name_hint, &deployment_id[..8]);
        request
            .env
            .insert("MCP_DEPLOYMENT_ID".to_string(), deployment_id.clone());

        let args = run_args(&request, &deployment_id, created_at, &pod_name);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.runner.run(&arg_refs).await?;
        if !output.success() {
            return Err(map_kubectl_error(&request.template_id, &output.stderr));
        }

        // The config snapshot is JSON and may contain commas, which the
        // comma-joined --annotations flag cannot carry. Annotate separately
        // so restart() can rebuild from the real snapshot.
        if let Some(config) = request.labels.get(LABEL_CONFIG) {
            let annotation = format!("{}={}", LABEL_CONFIG, config);
            let annotated = self
                .runner
                .run(&["annotate", "pod", &pod_name, &annotation])
                .await?;
            if !annotated.success() {
                tracing::warn!(
                    pod = %pod_name,
                    stderr = %annotated.stderr.trim(),
                    "failed to annotate pod with its config snapshot"
                );
            }
        }

        let deployment_labels = BTreeMap::from([
            (LABEL_TEMPLATE.to_string(), request.template_id.clone()),
            (LABEL_DEPLOYMENT_ID.to_string(), deployment_id.clone()),
            (LABEL_CREATED_AT.to_string(), created_at.to_rfc3339()),
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
            (LABEL_TRANSPORT.to_string(), request.transport.to_string()),
        ]);
        let config = request
            .labels
            .get(LABEL_CONFIG)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);

        Ok(Deployment {
            deployment_id,
            template_id: request.template_id,
            status: DeploymentStatus::Pending,
            backend: BackendKind::Kubernetes,
            transport: request.transport,
            network: None,
            ports: request
                .port
                .map(|p| PortMapping {
                    host: p.container,
                    container: p.container,
                })
                .into_iter()
                .collect(),
            created_at,
            labels: deployment_labels,
            config,
        })
    }

    pub async fn stop(&self, deployment_id: &str, timeout: Duration) -> crate::Result<()> {
        let Some(pod) = self.resolve_pod(deployment_id).await? else {
            tracing::debug!(deployment = %deployment_id, "stop on absent pod is a no-op");
            return Ok(());
        };
        let grace = format!("--grace-period={}", timeout.as_secs().max(1));
        let output = self
            .runner
            .run(&["delete", "pod", &pod, &grace, "--ignore-not-found"])
            .await?;
        if !output.success() {
            return Err(map_kubectl_error(deployment_id, &output.stderr));
        }
        Ok(())
    }

    pub async fn list(&self, filter: &DeploymentFilter) -> crate::Result<Vec<Deployment>> {
        let mut selector = format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY_VALUE);
        if let Some(ref template_id) = filter.template_id {
            selector.push_str(&format!(",{}={}", LABEL_TEMPLATE, template_id));
        }
        let output = self
            .runner
            .run(&["get", "pods", "-l", &selector, "-o", "json"])
            .await?;
        if !output.success() {
            return Err(map_kubectl_error("get pods", &output.stderr));
        }
        let pods = parse_pod_list(&output.stdout)?;
        let mut deployments: Vec<Deployment> = pods
            .items
            .iter()
            .filter_map(deployment_from_pod)
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
        let pod = self
            .resolve_pod(deployment_id)
            .await?
            .ok_or_else(|| StevedoreError::DeploymentNotFound(deployment_id.to_string()))?;
        let mut args: Vec<String> = vec!["logs".into()];
        if let Some(tail) = options.tail {
            args.push(format!("--tail={}", tail));
        }
        if options.follow {
            args.push("--follow".into());
        }
        args.push(pod);
        self.runner
            .spawn_streaming(args, BTreeMap::new(), CancellationToken::new())
    }

    pub async fn exec(
        &self,
        deployment_id: &str,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> crate::Result<Vec<u8>> {
        let pod = self
            .resolve_pod(deployment_id)
            .await?
            .ok_or_else(|| StevedoreError::DeploymentNotFound(deployment_id.to_string()))?;
        let mut args: Vec<String> = vec!["exec".into(), "-i".into(), pod, "--".into()];
        args.extend(argv);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .runner
            .run_with_stdin(&arg_refs, stdin.as_deref())
            .await?;
        if !output.success() {
            return Err(map_kubectl_error(deployment_id, &output.stderr));
        }
        Ok(output.stdout.into_bytes())
    }

    /// `kubectl run -i --rm --restart=Never` spec for an ephemeral session.
    pub fn stdio_exec_spec(&self, request: &DeployRequest) -> ExecSpec {
        let probe_name = format!("{}-probe-{}", request.name_hint, &uuid::Uuid::new_v4().to_string()[..8]);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-i".into(),
            "--rm".into(),
            "--restart=Never".into(),
            "-q".into(),
            probe_name,
            format!("--image={}", request.image),
        ];
        for (key, value) in &request.env {
            args.push(format!("--env={}={}", key, value));
        }
        if !request.args.is_empty() {
            args.push("--".into());
            args.extend(request.args.iter().cloned());
        }
        ExecSpec {
            program: "kubectl".to_string(),
            args,
            env: BTreeMap::new(),
        }
    }

    async fn resolve_pod(&self, deployment_id: &str) -> crate::Result<Option<String>> {
        let selector = format!("{}={}", LABEL_DEPLOYMENT_ID, deployment_id);
        let output = self
            .runner
            .run(&[
                "get",
                "pods",
                "-l",
                &selector,
                "-o",
                "jsonpath={.items[*].metadata.name}",
            ])
            .await?;
        if !output.success() {
            return Err(map_kubectl_error(deployment_id, &output.stderr));
        }
        Ok(output
            .stdout
            .split_whitespace()
            .next()
            .map(str::to_string))
    }
}

/// The `kubectl run` invocation for one deployment. `--labels` and
/// `--annotations` are each passed exactly once, comma-joined, mirroring
/// `docker.rs`'s `platform_labels`; the transport is a plain label value.
fn run_args(
    request: &DeployRequest,
    deployment_id: &str,
    created_at: DateTime<Utc>,
    pod_name: &str,
) -> Vec<String> {
    let labels = format!(
        "{}={},{}={},{}={},{}={}",
        LABEL_TEMPLATE,
        request.template_id,
        LABEL_DEPLOYMENT_ID,
        deployment_id,
        LABEL_MANAGED_BY,
        MANAGED_BY_VALUE,
        LABEL_TRANSPORT,
        request.transport,
    );
    // Comma-safe annotation values only; the config snapshot goes through
    // `kubectl annotate` after the pod exists.
    let mut annotations = vec![format!("{}={}", LABEL_CREATED_AT, created_at.to_rfc3339())];
    if let Some(hash) = request.labels.get(LABEL_CONFIG_HASH) {
        annotations.push(format!("{}={}", LABEL_CONFIG_HASH, hash));
    }

    let mut args: Vec<String> = vec![
        "run".into(),
        pod_name.to_string(),
        format!("--image={}", request.image),
        "--restart=Never".into(),
        format!("--labels={}", labels),
        format!("--annotations={}", annotations.join(",")),
    ];
    for (key, value) in &request.env {
        args.push(format!("--env={}={}", key, value));
    }
    if let Some(port) = request.port {
        args.push(format!("--port={}", port.container));
    }
    if !request.args.is_empty() {
        args.push("--".into());
        args.extend(request.args.iter().cloned());
    }
    args
}

fn map_kubectl_error(context: &str, stderr: &str) -> StevedoreError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("unable to connect to the server") || lower.contains("connection refused") {
        StevedoreError::BackendUnavailable("kubernetes".to_string(), message)
    } else if lower.contains("errimagepull") || lower.contains("imagepullbackoff") {
        StevedoreError::ImagePull(context.to_string(), message)
    } else if lower.contains("not found") {
        StevedoreError::DeploymentNotFound(context.to_string())
    } else {
        StevedoreError::Deployment(context.to_string(), message)
    }
}

// --- kubectl get -o json parsing --------------------------------------------

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    #[allow(dead_code)]
    name: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
    #[serde(rename = "creationTimestamp", default)]
    creation_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
}

fn parse_pod_list(raw: &str) -> crate::Result<PodList> {
    serde_json::from_str(raw)
        .map_err(|e| StevedoreError::Deployment("get pods".to_string(), e.to_string()))
}

fn pod_phase_status(phase: Option<&str>) -> DeploymentStatus {
    match phase {
        Some("Running") => DeploymentStatus::Running,
        Some("Pending") => DeploymentStatus::Pending,
        Some("Succeeded") => DeploymentStatus::Stopped,
        Some("Failed") => DeploymentStatus::Failed,
        _ => DeploymentStatus::Pending,
    }
}

fn deployment_from_pod(pod: &Pod) -> Option<Deployment> {
    if pod.metadata.labels.get(LABEL_MANAGED_BY).map(String::as_str) != Some(MANAGED_BY_VALUE) {
        return None;
    }
    let deployment_id = pod.metadata.labels.get(LABEL_DEPLOYMENT_ID)?.clone();
    let template_id = pod.metadata.labels.get(LABEL_TEMPLATE)?.clone();
    let transport = match pod.metadata.labels.get(LABEL_TRANSPORT).map(String::as_str) {
        Some("stdio") => Transport::Stdio,
        _ => Transport::Http,
    };
    let created_at = pod
        .metadata
        .annotations
        .get(LABEL_CREATED_AT)
        .or(pod.metadata.creation_timestamp.as_ref())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let config = pod
        .metadata
        .annotations
        .get(LABEL_CONFIG)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(serde_json::Value::Null);

    let mut labels: BTreeMap<String, String> = pod
        .metadata
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in &pod.metadata.annotations {
        labels.entry(k.clone()).or_insert_with(|| v.clone());
    }

    Some(Deployment {
        deployment_id,
        template_id,
        status: pod_phase_status(pod.status.phase.as_deref()),
        backend: BackendKind::Kubernetes,
        transport,
        network: None,
        ports: Vec::new(),
        created_at,
        labels,
        config,
    })
}
