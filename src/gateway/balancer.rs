//! Load balancer — per-template instance selection.
//!
//! Selection is synchronous and never suspends: the state is atomics and a
//! short std mutex for the smooth-weighted counters. All strategies operate
//! on the healthy subset with ties broken deterministically (instance id
//! lexicographic order through a shared round-robin counter).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::StevedoreError;
use crate::gateway::registry::{InstanceRecord, TemplateRouting};

/// Instance selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    HealthBased,
    Random,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastConnections => "least-connections",
            Strategy::Weighted => "weighted",
            Strategy::HealthBased => "health-based",
            Strategy::Random => "random",
        };
        write!(f, "{}", name)
    }
}

/// Per-template balancer policy, persisted with the routing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

/// RAII guard counting one active forwarded request on an instance.
pub struct ActiveGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct LoadBalancer {
    /// Per-template monotonic round-robin counter.
    round_robin: DashMap<String, AtomicUsize>,
    /// Per-instance count of currently active forwarded requests.
    active: DashMap<String, Arc<AtomicUsize>>,
    /// Per-template smooth-weighted-round-robin running counters.
    weighted: DashMap<String, Mutex<HashMap<String, i64>>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a healthy instance for the template, skipping `exclude`.
    ///
    /// Fails with `NoHealthyInstances` when the candidate set is empty.
    /// O(k) in the candidate count and never blocks.
    pub fn select(
        &self,
        template_id: &str,
        routing: &TemplateRouting,
        exclude: &HashSet<String>,
    ) -> crate::Result<InstanceRecord> {
        let mut healthy: Vec<&InstanceRecord> = routing
            .instances
            .iter()
            .filter(|i| i.is_healthy() && !exclude.contains(&i.instance_id))
            .collect();
        if healthy.is_empty() {
            return Err(StevedoreError::NoHealthyInstances(template_id.to_string()));
        }
        healthy.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let selected = match routing.policy.strategy {
            Strategy::RoundRobin => healthy[self.next_index(template_id, healthy.len())],
            Strategy::LeastConnections => {
                let minimum = healthy
                    .iter()
                    .map(|i| self.active_count(&i.instance_id))
                    .min()
                    .unwrap_or(0);
                let minima: Vec<&InstanceRecord> = healthy
                    .iter()
                    .copied()
                    .filter(|i| self.active_count(&i.instance_id) == minimum)
                    .collect();
                minima[self.next_index(template_id, minima.len())]
            }
            Strategy::Weighted => self.select_weighted(template_id, &healthy),
            Strategy::HealthBased => {
                let best = healthy
                    .iter()
                    .map(|i| i.health_score())
                    .fold(f64::MIN, f64::max);
                let maxima: Vec<&InstanceRecord> = healthy
                    .iter()
                    .copied()
                    .filter(|i| i.health_score() == best)
                    .collect();
                maxima[self.next_index(template_id, maxima.len())]
            }
            Strategy::Random => healthy[rand::thread_rng().gen_range(0..healthy.len())],
        };
        Ok(selected.clone())
    }

    /// Smooth weighted round-robin: add each weight to a running counter,
    /// pick the maximum, subtract the total from the winner. Weight 0 is
    /// never selected; an all-zero pool degrades to uniform round-robin.
    fn select_weighted<'a>(
        &self,
        template_id: &str,
        healthy: &[&'a InstanceRecord],
    ) -> &'a InstanceRecord {
        let weighted: Vec<&InstanceRecord> =
            healthy.iter().copied().filter(|i| i.weight > 0).collect();
        if weighted.is_empty() {
            return healthy[self.next_index(template_id, healthy.len())];
        }
        let total: i64 = weighted.iter().map(|i| i.weight as i64).sum();

        let entry = self
            .weighted
            .entry(template_id.to_string())
            .or_insert_with(|| Mutex::new(HashMap::new()));
        let mut counters = entry.lock().expect("weighted counters poisoned");

        let mut winner = weighted[0];
        let mut winner_current = i64::MIN;
        for &instance in &weighted {
            let current = counters.entry(instance.instance_id.clone()).or_insert(0);
            *current += instance.weight as i64;
            if *current > winner_current {
                winner_current = *current;
                winner = instance;
            }
        }
        *counters
            .entry(winner.instance_id.clone())
            .or_insert(0) -= total;
        winner
    }

    fn next_index(&self, template_id: &str, len: usize) -> usize {
        let counter = self
            .round_robin
            .entry(template_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        counter.fetch_add(1, Ordering::SeqCst) % len
    }

    /// Count one active request on the instance; the guard releases it.
    pub fn acquire(&self, instance_id: &str) -> ActiveGuard {
        let counter = self
            .active
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst);
        ActiveGuard { counter }
    }

    pub fn active_count(&self, instance_id: &str) -> usize {
        self.active
            .get(instance_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::registry::InstanceRecord;

    fn routing(strategy: Strategy, instances: Vec<InstanceRecord>) -> TemplateRouting {
        TemplateRouting {
            instances,
            policy: BalancerConfig {
                strategy,
                ..Default::default()
            },
            extra: serde_json::Map::new(),
        }
    }

    fn instance(id: &str) -> InstanceRecord {
        InstanceRecord::http(id, "demo", format!("http://127.0.0.1:9000/{}", id))
    }

    fn unhealthy(id: &str) -> InstanceRecord {
        let mut record = instance(id);
        record.status = crate::gateway::registry::InstanceStatus::Unhealthy;
        record
    }

    #[test]
    fn test_round_robin_fairness() {
        let balancer = LoadBalancer::new();
        let routing = routing(
            Strategy::RoundRobin,
            vec![instance("a"), instance("b"), instance("c")],
        );
        let picks: Vec<String> = (0..9)
            .map(|_| {
                balancer
                    .select("demo", &routing, &HashSet::new())
                    .unwrap()
                    .instance_id
            })
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_never_selects_unhealthy() {
        let balancer = LoadBalancer::new();
        let routing = routing(
            Strategy::RoundRobin,
            vec![instance("a"), unhealthy("b"), instance("c")],
        );
        for _ in 0..20 {
            let picked = balancer.select("demo", &routing, &HashSet::new()).unwrap();
            assert_ne!(picked.instance_id, "b");
        }
    }

    #[test]
    fn test_no_healthy_instances() {
        let balancer = LoadBalancer::new();
        let empty = routing(Strategy::RoundRobin, vec![]);
        assert!(matches!(
            balancer.select("demo", &empty, &HashSet::new()),
            Err(StevedoreError::NoHealthyInstances(t)) if t == "demo"
        ));

        let all_down = routing(Strategy::RoundRobin, vec![unhealthy("a")]);
        assert!(matches!(
            balancer.select("demo", &all_down, &HashSet::new()),
            Err(StevedoreError::NoHealthyInstances(_))
        ));
    }

    #[test]
    fn test_single_instance() {
        let balancer = LoadBalancer::new();
        let routing = routing(Strategy::RoundRobin, vec![instance("only")]);
        for _ in 0..3 {
            assert_eq!(
                balancer
                    .select("demo", &routing, &HashSet::new())
                    .unwrap()
                    .instance_id,
                "only"
            );
        }
    }

    #[test]
    fn test_exclusion_skips_failed_instance() {
        let balancer = LoadBalancer::new();
        let routing = routing(Strategy::RoundRobin, vec![instance("a"), instance("b")]);
        let exclude = HashSet::from(["a".to_string()]);
        for _ in 0..5 {
            assert_eq!(
                balancer
                    .select("demo", &routing, &exclude)
                    .unwrap()
                    .instance_id,
                "b"
            );
        }
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let balancer = LoadBalancer::new();
        let routing = routing(
            Strategy::LeastConnections,
            vec![instance("a"), instance("b")],
        );
        let _busy = balancer.acquire("a");
        for _ in 0..3 {
            assert_eq!(
                balancer
                    .select("demo", &routing, &HashSet::new())
                    .unwrap()
                    .instance_id,
                "b"
            );
        }
    }

    #[test]
    fn test_active_guard_releases_on_drop() {
        let balancer = LoadBalancer::new();
        {
            let _one = balancer.acquire("a");
            let _two = balancer.acquire("a");
            assert_eq!(balancer.active_count("a"), 2);
        }
        assert_eq!(balancer.active_count("a"), 0);
    }

    #[test]
    fn test_weighted_ratio() {
        let balancer = LoadBalancer::new();
        let routing = routing(
            Strategy::Weighted,
            vec![instance("a").with_weight(2), instance("b").with_weight(1)],
        );
        let picks: Vec<String> = (0..6)
            .map(|_| {
                balancer
                    .select("demo", &routing, &HashSet::new())
                    .unwrap()
                    .instance_id
            })
            .collect();
        let a_count = picks.iter().filter(|p| *p == "a").count();
        assert_eq!(a_count, 4, "weight 2:1 over 6 picks: {:?}", picks);
        // Smooth WRR interleaves rather than bursting.
        assert_eq!(picks[0], "a");
        assert_eq!(picks[1], "b");
    }

    #[test]
    fn test_weight_zero_never_selected() {
        let balancer = LoadBalancer::new();
        let routing = routing(
            Strategy::Weighted,
            vec![instance("a").with_weight(0), instance("b").with_weight(1)],
        );
        for _ in 0..10 {
            assert_eq!(
                balancer
                    .select("demo", &routing, &HashSet::new())
                    .unwrap()
                    .instance_id,
                "b"
            );
        }
    }

    #[test]
    fn test_all_weights_zero_is_uniform() {
        let balancer = LoadBalancer::new();
        let routing = routing(
            Strategy::Weighted,
            vec![instance("a").with_weight(0), instance("b").with_weight(0)],
        );
        let picks: Vec<String> = (0..4)
            .map(|_| {
                balancer
                    .select("demo", &routing, &HashSet::new())
                    .unwrap()
                    .instance_id
            })
            .collect();
        assert_eq!(picks, ["a", "b", "a", "b"]);
    }

    #[test]
    fn test_health_based_prefers_better_score() {
        let balancer = LoadBalancer::new();
        let mut good = instance("good");
        good.probe_history = std::collections::VecDeque::from(vec![true; 10]);
        let mut flaky = instance("flaky");
        flaky.probe_history =
            std::collections::VecDeque::from(vec![true, false, true, false, false]);
        let routing = routing(Strategy::HealthBased, vec![flaky, good]);
        for _ in 0..5 {
            assert_eq!(
                balancer
                    .select("demo", &routing, &HashSet::new())
                    .unwrap()
                    .instance_id,
                "good"
            );
        }
    }

    #[test]
    fn test_random_selects_member() {
        let balancer = LoadBalancer::new();
        let routing = routing(Strategy::Random, vec![instance("a"), instance("b")]);
        for _ in 0..20 {
            let picked = balancer.select("demo", &routing, &HashSet::new()).unwrap();
            assert!(["a", "b"].contains(&picked.instance_id.as_str()));
        }
    }
}
