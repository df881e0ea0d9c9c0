//! In-memory mock backend for tests.
//!
//! Preserves the observable semantics of the real backends — label-based
//! discovery, idempotent stop, ephemeral host-port assignment — without
//! touching a container runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::backend::{
    BackendKind, DeployRequest, Deployment, DeploymentFilter, DeploymentStatus, ExecSpec,
    LogOptions, LogStream, PortMapping, LABEL_CONFIG, LABEL_CREATED_AT, LABEL_DEPLOYMENT_ID,
    LABEL_MANAGED_BY, LABEL_TEMPLATE, LABEL_TRANSPORT, MANAGED_BY_VALUE,
};
use crate::error::StevedoreError;

struct MockEntry {
    deployment: Deployment,
    logs: Vec<String>,
}

#[derive(Default)]
pub struct MockBackend {
    state: RwLock<HashMap<String, MockEntry>>,
    next_port: AtomicU16,
    /// When set, the next deploy fails with this message (for retry tests).
    deploy_error: RwLock<Option<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
            next_port: AtomicU16::new(30000),
            deploy_error: RwLock::new(None),
        }
    }

    /// Make the next `deploy` call fail, for failure-path tests.
    pub async fn fail_next_deploy(&self, message: impl Into<String>) {
        *self.deploy_error.write().await = Some(message.into());
    }

    /// Append a canned log line to a deployment.
    pub async fn push_log(&self, deployment_id: &str, line: impl Into<String>) {
        if let Some(entry) = self.state.write().await.get_mut(deployment_id) {
            entry.logs.push(line.into());
        }
    }

    pub async fn deploy(&self, request: DeployRequest) -> crate::Result<Deployment> {
        if let Some(message) = self.deploy_error.write().await.take() {
            return Err(StevedoreError::Deployment(request.template_id, message));
        }

        let deployment_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();

        let mut labels = BTreeMap::from([
            (LABEL_TEMPLATE.to_string(), request.template_id.clone()),
            (LABEL_DEPLOYMENT_ID.to_string(), deployment_id.clone()),
            (LABEL_CREATED_AT.to_string(), created_at.to_rfc3339()),
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
            (LABEL_TRANSPORT.to_string(), request.transport.to_string()),
        ]);
        labels.extend(request.labels.clone());

        let ports = request
            .port
            .map(|p| PortMapping {
                host: if p.host == 0 {
                    self.next_port.fetch_add(1, Ordering::SeqCst)
                } else {
                    p.host
                },
                container: p.container,
            })
            .into_iter()
            .collect();

        let config = labels
            .get(LABEL_CONFIG)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);

        let deployment = Deployment {
            deployment_id: deployment_id.clone(),
            template_id: request.template_id.clone(),
            status: DeploymentStatus::Running,
            backend: BackendKind::Mock,
            transport: request.transport,
            network: Some("mock".to_string()),
            ports,
            created_at,
            labels,
            config,
        };

        self.state.write().await.insert(
            deployment_id,
            MockEntry {
                deployment: deployment.clone(),
                logs: vec![format!("mock: {} started", request.template_id)],
            },
        );
        Ok(deployment)
    }

    pub async fn stop(&self, deployment_id: &str, _timeout: Duration) -> crate::Result<()> {
        // Idempotent: stopping an absent deployment is a no-op.
        self.state.write().await.remove(deployment_id);
        Ok(())
    }

    pub async fn list(&self, filter: &DeploymentFilter) -> crate::Result<Vec<Deployment>> {
        let state = self.state.read().await;
        let mut deployments: Vec<Deployment> = state
            .values()
            .map(|e| e.deployment.clone())
            .filter(|d| {
                filter
                    .template_id
                    .as_ref()
                    .is_none_or(|t| &d.template_id == t)
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
        let state = self.state.read().await;
        let entry = state
            .get(deployment_id)
            .ok_or_else(|| StevedoreError::DeploymentNotFound(deployment_id.to_string()))?;
        let mut lines = entry.logs.clone();
        if let Some(tail) = options.tail {
            let keep = tail as usize;
            if lines.len() > keep {
                lines = lines.split_off(lines.len() - keep);
            }
        }
        let (tx, rx) = tokio::sync::mpsc::channel(lines.len().max(1));
        tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    pub async fn exec(
        &self,
        deployment_id: &str,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> crate::Result<Vec<u8>> {
        let state = self.state.read().await;
        if !state.contains_key(deployment_id) {
            return Err(StevedoreError::DeploymentNotFound(deployment_id.to_string()));
        }
        let mut output = argv.join(" ").into_bytes();
        if let Some(input) = stdin {
            output.push(b'\n');
            output.extend(input);
        }
        Ok(output)
    }

    /// The mock has nothing to spawn; discovery's stdio tier fails over to
    /// static metadata, which is exactly the observable behavior wanted in
    /// tests.
    pub fn stdio_exec_spec(&self, _request: &DeployRequest) -> ExecSpec {
        ExecSpec {
            program: "/nonexistent/mock-mcp".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Transport;

    fn request(template: &str) -> DeployRequest {
        DeployRequest {
            template_id: template.to_string(),
            image: format!("example/{}", template),
            name_hint: template.to_string(),
            transport: Transport::Http,
            env: BTreeMap::new(),
            mounts: vec![],
            args: vec![],
            network: None,
            port: Some(PortMapping {
                host: 0,
                container: 8080,
            }),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_deploy_then_list_then_stop() {
        let backend = MockBackend::new();
        let deployed = backend.deploy(request("demo")).await.unwrap();
        assert_eq!(deployed.status, DeploymentStatus::Running);
        assert_eq!(deployed.ports[0].container, 8080);
        assert!(deployed.ports[0].host >= 30000);

        let listed = backend.list(&DeploymentFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].deployment_id, deployed.deployment_id);

        backend
            .stop(&deployed.deployment_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(backend.list(&DeploymentFilter::default()).await.unwrap().is_empty());

        // Stop is idempotent on already-stopped deployments.
        backend
            .stop(&deployed.deployment_id, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_by_template() {
        let backend = MockBackend::new();
        backend.deploy(request("alpha")).await.unwrap();
        backend.deploy(request("beta")).await.unwrap();

        let filter = DeploymentFilter {
            template_id: Some("alpha".to_string()),
            include_stopped: false,
        };
        let listed = backend.list(&filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].template_id, "alpha");
    }

    #[tokio::test]
    async fn test_logs_stream_with_tail() {
        let backend = MockBackend::new();
        let deployed = backend.deploy(request("demo")).await.unwrap();
        backend.push_log(&deployed.deployment_id, "line two").await;
        backend.push_log(&deployed.deployment_id, "line three").await;

        let mut rx = backend
            .logs(
                &deployed.deployment_id,
                LogOptions {
                    tail: Some(2),
                    follow: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "line two");
        assert_eq!(rx.recv().await.unwrap(), "line three");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_logs_unknown_deployment() {
        let backend = MockBackend::new();
        let result = backend.logs("ghost", LogOptions::default()).await;
        assert!(matches!(result, Err(StevedoreError::DeploymentNotFound(_))));
    }

    #[tokio::test]
    async fn test_fail_next_deploy() {
        let backend = MockBackend::new();
        backend.fail_next_deploy("simulated crash").await;
        let result = backend.deploy(request("demo")).await;
        assert!(matches!(result, Err(StevedoreError::Deployment(t, m)) if t == "demo" && m == "simulated crash"));
        // Subsequent deploys succeed again.
        assert!(backend.deploy(request("demo")).await.is_ok());
    }

    #[tokio::test]
    async fn test_exec_echoes() {
        let backend = MockBackend::new();
        let deployed = backend.deploy(request("demo")).await.unwrap();
        let output = backend
            .exec(
                &deployed.deployment_id,
                vec!["ls".into(), "-la".into()],
                Some(b"input".to_vec()),
            )
            .await
            .unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "ls -la\ninput");
    }
}
