//! Gateway registry — durable routing state.
//!
//! Holds `{template → TemplateRouting}` where each routing entry carries the
//! registered instances and the per-template load-balancer policy. Every
//! mutation is persisted to a JSON file through an atomic
//! write-temp-then-rename, and the full state is reloaded on startup.
//! Readers receive consistent snapshots; writers hold the exclusive lock for
//! the duration of the mutation and the persistence write.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StevedoreError;
use crate::gateway::balancer::BalancerConfig;
use crate::template::Transport;

/// Probes kept per instance for the health-based balancer score.
pub const PROBE_HISTORY: usize = 10;

/// Gateway view of one instance's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Where requests for an instance go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Endpoint {
    Http {
        url: String,
    },
    Stdio {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

impl Endpoint {
    /// Health-probe URL for HTTP endpoints: the endpoint origin + `/health`.
    pub fn health_url(&self) -> Option<String> {
        match self {
            Endpoint::Http { url } => {
                let mut parsed = url::Url::parse(url).ok()?;
                parsed.set_path("/health");
                parsed.set_query(None);
                Some(parsed.to_string())
            }
            Endpoint::Stdio { .. } => None,
        }
    }
}

/// A deployment registered with the gateway for routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub template_id: String,
    pub transport: Transport,
    pub endpoint: Endpoint,
    #[serde(default = "default_status")]
    pub status: InstanceStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    /// Recent probe outcomes, newest last. In-memory only.
    #[serde(skip)]
    pub probe_history: VecDeque<bool>,
    /// Issue time of the newest applied probe; enforces monotonic updates.
    #[serde(skip)]
    pub last_probe_issued: Option<Instant>,
}

fn default_status() -> InstanceStatus {
    InstanceStatus::Healthy
}

fn default_weight() -> u32 {
    1
}

impl InstanceRecord {
    /// An HTTP-transport instance. Registration is optimistic: the instance
    /// starts healthy and the checker demotes it if probes fail.
    pub fn http(
        instance_id: impl Into<String>,
        template_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            template_id: template_id.into(),
            transport: Transport::Http,
            endpoint: Endpoint::Http { url: url.into() },
            status: InstanceStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: None,
            weight: 1,
            metadata: serde_json::Map::new(),
            probe_history: VecDeque::new(),
            last_probe_issued: None,
        }
    }

    /// A stdio-transport instance backed by an exec spec.
    pub fn stdio(
        instance_id: impl Into<String>,
        template_id: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            template_id: template_id.into(),
            transport: Transport::Stdio,
            endpoint: Endpoint::Stdio {
                program: program.into(),
                args,
                env,
            },
            status: InstanceStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: None,
            weight: 1,
            metadata: serde_json::Map::new(),
            probe_history: VecDeque::new(),
            last_probe_issued: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }

    /// Recency-weighted success ratio over the probe history (newest probes
    /// weigh more). Instances without history score 1.0.
    pub fn health_score(&self) -> f64 {
        if self.probe_history.is_empty() {
            return 1.0;
        }
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (index, ok) in self.probe_history.iter().enumerate() {
            let weight = (index + 1) as f64;
            total += weight;
            if *ok {
                weighted += weight;
            }
        }
        weighted / total
    }
}

/// Routing entry for one template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateRouting {
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub policy: BalancerConfig,
    /// Unknown fields, preserved round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Persisted registry document: `{templates: {...}, version: <int>}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateRouting>,
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One probe outcome to apply to the registry.
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub success: bool,
    /// When the probe was issued; later-completing probes with earlier issue
    /// times never override newer results.
    pub issued_at: Instant,
    pub checked_at: DateTime<Utc>,
}

/// Streak thresholds for health transitions.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub max_consecutive_failures: u32,
    pub min_consecutive_successes: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            min_consecutive_successes: 1,
        }
    }
}

/// A health-state change produced by `update_health`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub template_id: String,
    pub instance_id: String,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

pub struct GatewayRegistry {
    path: Option<PathBuf>,
    state: RwLock<RegistryState>,
}

impl GatewayRegistry {
    /// Registry without persistence, for tests and ephemeral gateways.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Load (or initialize) a file-backed registry.
    pub async fn load(path: PathBuf) -> crate::Result<Self> {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| StevedoreError::Persistence(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryState::default(),
            Err(e) => {
                return Err(StevedoreError::Persistence(format!(
                    "{}: {}",
                    path.display(),
                    e
                )));
            }
        };
        tracing::info!(
            path = %path.display(),
            templates = state.templates.len(),
            version = state.version,
            "gateway registry loaded"
        );
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// Consistent point-in-time copy of the full state.
    pub async fn snapshot(&self) -> RegistryState {
        self.state.read().await.clone()
    }

    /// Routing entry for one template.
    pub async fn routing(&self, template_id: &str) -> Option<TemplateRouting> {
        self.state.read().await.templates.get(template_id).cloned()
    }

    /// All registered instances across templates.
    pub async fn instances(&self) -> Vec<InstanceRecord> {
        self.state
            .read()
            .await
            .templates
            .values()
            .flat_map(|routing| routing.instances.iter().cloned())
            .collect()
    }

    /// Health of one instance, looked up by id across templates.
    pub async fn instance_status(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.state
            .read()
            .await
            .templates
            .values()
            .flat_map(|routing| routing.instances.iter())
            .find(|i| i.instance_id == instance_id)
            .map(|i| i.status)
    }

    /// Register (or replace) an instance; optionally set the template policy.
    ///
    /// Persistence failure is fatal for the mutation: the in-memory state is
    /// left untouched and the error surfaces to the caller.
    pub async fn register(
        &self,
        instance: InstanceRecord,
        policy: Option<BalancerConfig>,
    ) -> crate::Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let routing = next.templates.entry(instance.template_id.clone()).or_default();
        routing.instances.retain(|i| i.instance_id != instance.instance_id);
        routing.instances.push(instance);
        routing.instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        if let Some(policy) = policy {
            routing.policy = policy;
        }
        next.version += 1;
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    /// Remove an instance; returns whether it existed. Empty routing entries
    /// are dropped with it.
    pub async fn deregister(&self, template_id: &str, instance_id: &str) -> crate::Result<bool> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let Some(routing) = next.templates.get_mut(template_id) else {
            return Ok(false);
        };
        let before = routing.instances.len();
        routing.instances.retain(|i| i.instance_id != instance_id);
        if routing.instances.len() == before {
            return Ok(false);
        }
        if routing.instances.is_empty() {
            next.templates.remove(template_id);
        }
        next.version += 1;
        self.persist(&next).await?;
        *state = next;
        Ok(true)
    }

    /// Remove an instance wherever it is registered; returns its template.
    pub async fn deregister_by_instance(
        &self,
        instance_id: &str,
    ) -> crate::Result<Option<String>> {
        let template_id = {
            let state = self.state.read().await;
            state
                .templates
                .iter()
                .find(|(_, routing)| {
                    routing.instances.iter().any(|i| i.instance_id == instance_id)
                })
                .map(|(template, _)| template.clone())
        };
        match template_id {
            Some(template) => {
                self.deregister(&template, instance_id).await?;
                Ok(Some(template))
            }
            None => Ok(None),
        }
    }

    /// Replace the balancer policy for a template.
    pub async fn set_policy(
        &self,
        template_id: &str,
        policy: BalancerConfig,
    ) -> crate::Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.templates.entry(template_id.to_string()).or_default().policy = policy;
        next.version += 1;
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    /// Apply one probe result and derive health transitions.
    ///
    /// Updates are monotonic per instance: a probe issued earlier than the
    /// newest applied probe is discarded. Persistence failure here is
    /// non-fatal — the in-memory update stands and a warning is logged.
    pub async fn update_health(
        &self,
        template_id: &str,
        instance_id: &str,
        probe: ProbeResult,
        thresholds: HealthThresholds,
    ) -> Option<HealthTransition> {
        let mut state = self.state.write().await;
        let instance = state
            .templates
            .get_mut(template_id)?
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)?;

        if let Some(newest) = instance.last_probe_issued {
            if probe.issued_at < newest {
                tracing::debug!(
                    instance = %instance_id,
                    "discarding stale probe result"
                );
                return None;
            }
        }
        instance.last_probe_issued = Some(probe.issued_at);
        instance.last_check = Some(probe.checked_at);
        instance.probe_history.push_back(probe.success);
        while instance.probe_history.len() > PROBE_HISTORY {
            instance.probe_history.pop_front();
        }

        let from = instance.status;
        if probe.success {
            instance.consecutive_successes += 1;
            instance.consecutive_failures = 0;
            if instance.status != InstanceStatus::Healthy
                && instance.consecutive_successes >= thresholds.min_consecutive_successes
            {
                instance.status = InstanceStatus::Healthy;
            }
        } else {
            instance.consecutive_failures += 1;
            instance.consecutive_successes = 0;
            if instance.status != InstanceStatus::Unhealthy
                && instance.consecutive_failures >= thresholds.max_consecutive_failures
            {
                instance.status = InstanceStatus::Unhealthy;
            }
        }
        let to = instance.status;

        state.version += 1;
        let snapshot = state.clone();
        drop(state);

        // Health persistence is best-effort.
        if let Err(e) = self.persist(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist health update");
        }

        (from != to).then(|| HealthTransition {
            template_id: template_id.to_string(),
            instance_id: instance_id.to_string(),
            from,
            to,
        })
    }

    /// Atomic write: serialize to a temp file beside the target, then rename.
    async fn persist(&self, state: &RegistryState) -> crate::Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let serialized = serde_json::to_vec_pretty(state)
            .map_err(|e| StevedoreError::Persistence(e.to_string()))?;
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, &serialized)
            .await
            .map_err(|e| StevedoreError::Persistence(format!("{}: {}", temp.display(), e)))?;
        tokio::fs::rename(&temp, path)
            .await
            .map_err(|e| StevedoreError::Persistence(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}
