//! Deployment manager — orchestrates registry, processor, and backend.
//!
//! `deploy` resolves the template, processes the layered config, and realizes
//! the container through the backend. Redeploying the same
//! `(template, config hash, explicit name)` identity is a no-op while a
//! matching deployment runs; a name collision with different config stops
//! the old deployment and starts the replacement. A dry-run performs the
//! full validation pipeline and returns the would-be plan without touching
//! the backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::backend::{
    Backend, DeployRequest, Deployment, DeploymentFilter, DeploymentStatus, PortMapping,
    LABEL_CONFIG, LABEL_CONFIG_HASH,
};
use crate::config::{ConfigLayers, ConfigProcessor, ProcessedConfig, VolumeMount};
use crate::error::StevedoreError;
use crate::gateway::registry::{GatewayRegistry, InstanceRecord, InstanceStatus};
use crate::template::{RegistryHandle, TemplateDescriptor, Transport};

/// Label carrying the caller-chosen deployment name for idempotent redeploy.
pub const LABEL_DEPLOY_NAME: &str = "mcp.deploy_name";

/// Default grace period passed to the backend on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Transport override; defaults to the template's default transport.
    pub transport: Option<Transport>,
    /// Explicit host port; defaults to an ephemeral port.
    pub port: Option<u16>,
    /// Explicit deployment name for idempotent redeploy.
    pub deployment_name: Option<String>,
    /// Validate and return the plan without calling the backend.
    pub dry_run: bool,
}

/// The would-be deployment, as returned by a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    pub template_id: String,
    pub image: String,
    pub transport: Transport,
    /// Sensitive values redacted.
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<PortMapping>,
    /// Sensitive values redacted.
    pub config: Value,
    pub config_hash: String,
}

/// Result of a deploy call.
#[derive(Debug)]
pub enum DeployOutcome {
    /// A new deployment was created.
    Deployed(Deployment),
    /// An identical deployment was already running; nothing changed.
    Unchanged(Deployment),
    /// Dry run: the validated plan.
    Plan(DeploymentPlan),
}

impl DeployOutcome {
    pub fn deployment(&self) -> Option<&Deployment> {
        match self {
            DeployOutcome::Deployed(d) | DeployOutcome::Unchanged(d) => Some(d),
            DeployOutcome::Plan(_) => None,
        }
    }
}

pub struct DeploymentManager {
    templates: RegistryHandle,
    backend: Arc<Backend>,
    gateway: Option<Arc<GatewayRegistry>>,
}

impl DeploymentManager {
    pub fn new(templates: RegistryHandle, backend: Arc<Backend>) -> Self {
        Self {
            templates,
            backend,
            gateway: None,
        }
    }

    /// Attach a gateway registry for status aggregation and cleanup.
    pub fn with_gateway(mut self, gateway: Arc<GatewayRegistry>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    async fn template(&self, template_id: &str) -> crate::Result<Arc<TemplateDescriptor>> {
        let registry = self.templates.read().await.clone();
        registry.get(template_id)
    }

    /// Realize a deployment (or return the plan / the unchanged original).
    pub async fn deploy(
        &self,
        template_id: &str,
        layers: &ConfigLayers,
        options: DeployOptions,
    ) -> crate::Result<DeployOutcome> {
        let template = self.template(template_id).await?;
        let processed = ConfigProcessor::new(&template).process(layers)?;
        let transport = options.transport.unwrap_or(template.transport.default);
        if !template.supports_transport(transport) {
            return Err(StevedoreError::InvalidConfiguration(
                "transport".to_string(),
                format!("template '{}' does not support {}", template.id, transport),
            ));
        }
        let config_hash = processed.config_hash();
        let port = deployment_port(&template, transport, options.port)?;

        if options.dry_run {
            return Ok(DeployOutcome::Plan(DeploymentPlan {
                template_id: template.id.clone(),
                image: template.image.clone(),
                transport,
                env: processed.redacted_env(),
                volumes: processed.volumes.clone(),
                args: processed.args.clone(),
                port,
                config: processed.redacted_values(),
                config_hash,
            }));
        }

        let existing = self
            .backend
            .list(&DeploymentFilter {
                template_id: Some(template.id.clone()),
                include_stopped: false,
            })
            .await?;

        // Same identity already running: no-op.
        if let Some(current) = existing.iter().find(|d| {
            d.status == DeploymentStatus::Running
                && d.config_hash() == Some(config_hash.as_str())
                && d.labels.get(LABEL_DEPLOY_NAME) == options.deployment_name.as_ref()
        }) {
            tracing::info!(
                template = %template.id,
                deployment = %current.deployment_id,
                "identical deployment already running"
            );
            return Ok(DeployOutcome::Unchanged(current.clone()));
        }

        // Same explicit name, different config: stop-then-start replacement.
        if let Some(ref name) = options.deployment_name {
            if let Some(previous) = existing
                .iter()
                .find(|d| d.labels.get(LABEL_DEPLOY_NAME) == Some(name))
            {
                tracing::info!(
                    template = %template.id,
                    deployment = %previous.deployment_id,
                    name = %name,
                    "replacing deployment"
                );
                self.stop(&previous.deployment_id).await?;
            }
        }

        let request =
            build_request(&template, &processed, transport, port, &options.deployment_name);
        let deployment = self.backend.deploy(request).await?;
        tracing::info!(
            template = %template.id,
            deployment = %deployment.deployment_id,
            backend = %deployment.backend,
            "deployment created"
        );
        Ok(DeployOutcome::Deployed(deployment))
    }

    /// Stop and remove a deployment; deregisters it from the gateway.
    pub async fn stop(&self, deployment_id: &str) -> crate::Result<()> {
        self.backend.stop(deployment_id, STOP_TIMEOUT).await?;
        if let Some(ref gateway) = self.gateway {
            match gateway.deregister_by_instance(deployment_id).await {
                Ok(Some(template)) => {
                    tracing::info!(
                        deployment = %deployment_id,
                        template = %template,
                        "deregistered from gateway"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(deployment = %deployment_id, error = %e, "gateway deregistration failed");
                }
            }
        }
        Ok(())
    }

    /// Stop-then-start from the deployment's stored config snapshot.
    pub async fn restart(&self, deployment_id: &str) -> crate::Result<Deployment> {
        let deployment = self.find(deployment_id).await?;
        let layers = match deployment.config {
            Value::Object(_) => ConfigLayers::default().with_file(deployment.config.clone()),
            _ => ConfigLayers::default(),
        };
        let options = DeployOptions {
            transport: Some(deployment.transport),
            port: None,
            deployment_name: deployment.labels.get(LABEL_DEPLOY_NAME).cloned(),
            dry_run: false,
        };
        self.stop(deployment_id).await?;
        match self
            .deploy(&deployment.template_id, &layers, options)
            .await?
        {
            DeployOutcome::Deployed(d) | DeployOutcome::Unchanged(d) => Ok(d),
            DeployOutcome::Plan(_) => unreachable!("restart never dry-runs"),
        }
    }

    /// All deployments, with gateway health folded into the status.
    pub async fn list(&self, filter: &DeploymentFilter) -> crate::Result<Vec<Deployment>> {
        let mut deployments = self.backend.list(filter).await?;
        let statuses = futures::future::join_all(
            deployments.iter().map(|d| self.aggregate_status(d)),
        )
        .await;
        for (deployment, status) in deployments.iter_mut().zip(statuses) {
            deployment.status = status;
        }
        Ok(deployments)
    }

    /// One deployment's aggregated status.
    pub async fn status(&self, deployment_id: &str) -> crate::Result<Deployment> {
        let mut deployment = self.find(deployment_id).await?;
        deployment.status = self.aggregate_status(&deployment).await;
        Ok(deployment)
    }

    /// Build the gateway instance record for a deployment.
    pub async fn gateway_instance(
        &self,
        deployment: &Deployment,
    ) -> crate::Result<InstanceRecord> {
        match deployment.transport {
            Transport::Http => {
                let url = deployment.endpoint_url().ok_or_else(|| {
                    StevedoreError::InvalidConfiguration(
                        "port".to_string(),
                        "http deployment has no published port".to_string(),
                    )
                })?;
                Ok(InstanceRecord::http(
                    &deployment.deployment_id,
                    &deployment.template_id,
                    url,
                ))
            }
            Transport::Stdio => {
                let template = self.template(&deployment.template_id).await?;
                let layers = match deployment.config {
                    Value::Object(_) => {
                        ConfigLayers::default().with_file(deployment.config.clone())
                    }
                    _ => ConfigLayers::default(),
                };
                let processed = ConfigProcessor::new(&template).process(&layers)?;
                let request =
                    build_request(&template, &processed, Transport::Stdio, None, &None);
                let spec = self.backend.stdio_exec_spec(&request);
                Ok(InstanceRecord::stdio(
                    &deployment.deployment_id,
                    &deployment.template_id,
                    spec.program,
                    spec.args,
                    spec.env,
                ))
            }
        }
    }

    /// Register a deployment with the gateway for routing.
    pub async fn register_with_gateway(&self, deployment: &Deployment) -> crate::Result<()> {
        let Some(ref gateway) = self.gateway else {
            return Err(StevedoreError::InvalidConfiguration(
                "gateway".to_string(),
                "no gateway registry attached".to_string(),
            ));
        };
        let instance = self.gateway_instance(deployment).await?;
        gateway.register(instance, None).await
    }

    /// Exec spec for an ephemeral stdio probe of a template, built from a
    /// defaults-only configuration.
    pub async fn stdio_probe_spec(
        &self,
        template_id: &str,
    ) -> crate::Result<crate::backend::ExecSpec> {
        let template = self.template(template_id).await?;
        if !template.supports_transport(Transport::Stdio) {
            return Err(StevedoreError::InvalidConfiguration(
                "transport".to_string(),
                format!("template '{}' does not support stdio", template.id),
            ));
        }
        let processed = ConfigProcessor::new(&template).process(&ConfigLayers::default())?;
        let request = build_request(&template, &processed, Transport::Stdio, None, &None);
        Ok(self.backend.stdio_exec_spec(&request))
    }

    async fn find(&self, deployment_id: &str) -> crate::Result<Deployment> {
        self.backend
            .list(&DeploymentFilter {
                template_id: None,
                include_stopped: true,
            })
            .await?
            .into_iter()
            .find(|d| d.deployment_id == deployment_id)
            .ok_or_else(|| StevedoreError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Backend-reported state combined with the latest gateway probe;
    /// the reported status is the worst of the two.
    async fn aggregate_status(&self, deployment: &Deployment) -> DeploymentStatus {
        if deployment.status != DeploymentStatus::Running {
            return deployment.status;
        }
        if let Some(ref gateway) = self.gateway {
            if gateway.instance_status(&deployment.deployment_id).await
                == Some(InstanceStatus::Unhealthy)
            {
                return DeploymentStatus::Unhealthy;
            }
        }
        deployment.status
    }
}

/// Host port plan: HTTP needs the declared container port, stdio needs none.
fn deployment_port(
    template: &TemplateDescriptor,
    transport: Transport,
    host: Option<u16>,
) -> crate::Result<Option<PortMapping>> {
    match transport {
        Transport::Http => {
            let container = template.port.ok_or_else(|| {
                StevedoreError::InvalidConfiguration(
                    "port".to_string(),
                    format!("template '{}' declares no port for http transport", template.id),
                )
            })?;
            Ok(Some(PortMapping {
                host: host.unwrap_or(0),
                container,
            }))
        }
        Transport::Stdio => Ok(None),
    }
}

fn build_request(
    template: &TemplateDescriptor,
    processed: &ProcessedConfig,
    transport: Transport,
    port: Option<PortMapping>,
    deployment_name: &Option<String>,
) -> DeployRequest {
    let mut env = processed.env.clone();
    // Identity vars; the backend fills in MCP_DEPLOYMENT_ID once it assigns
    // the id.
    let mut identity = crate::config::identity_env(template, "", transport);
    identity.remove("MCP_DEPLOYMENT_ID");
    env.extend(identity);

    let mut labels = BTreeMap::from([
        (LABEL_CONFIG_HASH.to_string(), processed.config_hash()),
        (
            LABEL_CONFIG.to_string(),
            serde_json::to_string(&processed.values).unwrap_or_default(),
        ),
    ]);
    if let Some(name) = deployment_name {
        labels.insert(LABEL_DEPLOY_NAME.to_string(), name.clone());
    }

    DeployRequest {
        template_id: template.id.clone(),
        image: template.image.clone(),
        name_hint: template.id.clone(),
        transport,
        env,
        mounts: processed.volumes.clone(),
        args: processed.args.clone(),
        network: None,
        port,
        labels,
    }
}
