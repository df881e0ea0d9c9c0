//! Health checker — periodic concurrent probes with jitter.
//!
//! On every tick the checker enumerates the registry's instances and
//! schedules one probe per instance. Each instance keeps a fixed random
//! phase offset in `[0, check_interval)` assigned on first sight, so probes
//! stay spread across the tick instead of thundering together. Probe
//! concurrency is bounded by a semaphore; shutdown cancels in-flight probes
//! and awaits them with a bounded grace period.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::gateway::registry::{
    Endpoint, GatewayRegistry, HealthThresholds, HealthTransition, InstanceRecord, ProbeResult,
};
use crate::template::Transport;

/// Grace period for in-flight probes at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_checks: usize,
    pub thresholds: HealthThresholds,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_concurrent_checks: 10,
            thresholds: HealthThresholds::default(),
        }
    }
}

pub struct HealthChecker {
    registry: Arc<GatewayRegistry>,
    config: HealthCheckerConfig,
    client: reqwest::Client,
    /// Per-instance probe phase within the tick, assigned once.
    phases: Mutex<HashMap<String, Duration>>,
    semaphore: Arc<Semaphore>,
    events: broadcast::Sender<HealthTransition>,
}

impl HealthChecker {
    pub fn new(registry: Arc<GatewayRegistry>, config: HealthCheckerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_checks.max(1)));
        let (events, _) = broadcast::channel(64);
        Self {
            registry,
            config,
            client: reqwest::Client::new(),
            phases: Mutex::new(HashMap::new()),
            semaphore,
            events,
        }
    }

    /// Health-transition events (eviction and readmission).
    pub fn subscribe(&self) -> broadcast::Receiver<HealthTransition> {
        self.events.subscribe()
    }

    /// Drive probes until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut probes: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let instances = self.registry.instances().await;
                    for instance in instances {
                        let phase = self.phase_for(&instance.instance_id);
                        let checker = self.clone();
                        let probe_cancel = cancel.child_token();
                        probes.spawn(async move {
                            checker.probe_instance(instance, phase, probe_cancel).await;
                        });
                    }
                    // Reap whatever finished since the last tick.
                    while probes.try_join_next().is_some() {}
                }
                _ = cancel.cancelled() => {
                    tracing::info!("health checker shutting down");
                    let drain = async {
                        while probes.join_next().await.is_some() {}
                    };
                    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
                        tracing::warn!("probes did not finish within grace period, aborting");
                        probes.abort_all();
                    }
                    return;
                }
            }
        }
    }

    /// First probe of an instance lands at a uniform random offset within the
    /// interval; subsequent probes reuse the same phase, spacing them exactly
    /// one interval apart.
    fn phase_for(&self, instance_id: &str) -> Duration {
        let mut phases = self.phases.lock().expect("phase map poisoned");
        *phases.entry(instance_id.to_string()).or_insert_with(|| {
            let interval = self.config.check_interval.as_millis().max(1) as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..interval))
        })
    }

    async fn probe_instance(
        &self,
        instance: InstanceRecord,
        phase: Duration,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(phase) => {}
            _ = cancel.cancelled() => return,
        }
        let Ok(_permit) = self.semaphore.acquire().await else {
            return;
        };

        let issued_at = Instant::now();
        let success = tokio::select! {
            success = self.probe(&instance) => success,
            _ = cancel.cancelled() => return,
        };

        let probe = ProbeResult {
            success,
            issued_at,
            checked_at: Utc::now(),
        };
        let transition = self
            .registry
            .update_health(
                &instance.template_id,
                &instance.instance_id,
                probe,
                self.config.thresholds,
            )
            .await;

        if let Some(transition) = transition {
            tracing::info!(
                template = %transition.template_id,
                instance = %transition.instance_id,
                from = ?transition.from,
                to = ?transition.to,
                "instance health transition"
            );
            let _ = self.events.send(transition);
        }
    }

    /// HTTP: 2xx from the health path within the timeout. stdio: a
    /// throwaway session answering `initialize` and `tools/list`.
    async fn probe(&self, instance: &InstanceRecord) -> bool {
        match instance.transport {
            Transport::Http => {
                let Some(url) = instance.endpoint.health_url() else {
                    return false;
                };
                match self
                    .client
                    .get(&url)
                    .timeout(self.config.probe_timeout)
                    .send()
                    .await
                {
                    Ok(response) => response.status().is_success(),
                    Err(e) => {
                        tracing::debug!(instance = %instance.instance_id, error = %e, "http probe failed");
                        false
                    }
                }
            }
            Transport::Stdio => {
                let Endpoint::Stdio {
                    ref program,
                    ref args,
                    ref env,
                } = instance.endpoint
                else {
                    return false;
                };
                let spec = crate::backend::ExecSpec {
                    program: program.clone(),
                    args: args.clone(),
                    env: env.clone(),
                };
                let session = match Connection::stdio(
                    instance.instance_id.clone(),
                    &spec,
                    self.config.probe_timeout,
                ) {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::debug!(instance = %instance.instance_id, error = %e, "stdio probe spawn failed");
                        return false;
                    }
                };
                let outcome = tokio::time::timeout(self.config.probe_timeout, async {
                    session.initialize().await?;
                    session.list_tools().await
                })
                .await;
                let success = matches!(outcome, Ok(Ok(_)));
                if !success {
                    tracing::debug!(instance = %instance.instance_id, "stdio probe failed");
                }
                session.close().await;
                success
            }
        }
    }
}
