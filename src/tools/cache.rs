//! Tool cache — sharded TTL entries with single-flight bookkeeping.
//!
//! Keyed by template id. Each entry carries the tools, the discovery method
//! that produced them, a timestamp, and the cache generation at insert time.
//! Writes are last-writer-wins; per-key flight locks ensure at most one live
//! probe per `(template, generation)` across concurrent callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::protocol::McpTool;

/// TTL for live-probed entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Shorter TTL for entries backed only by static template metadata.
pub const STATIC_TTL: Duration = Duration::from_secs(60 * 60);

/// Timestamp extension applied when a background revalidation fails.
pub const REVALIDATE_GRACE: Duration = Duration::from_secs(5 * 60);

/// Fraction of the TTL after which a hit triggers background revalidation.
const REVALIDATE_THRESHOLD: f64 = 0.9;

/// How a tool list was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    Cache,
    Http,
    Stdio,
    Static,
    None,
}

impl std::fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DiscoveryMethod::Cache => "cache",
            DiscoveryMethod::Http => "http",
            DiscoveryMethod::Stdio => "stdio",
            DiscoveryMethod::Static => "static",
            DiscoveryMethod::None => "none",
        };
        write!(f, "{}", name)
    }
}

/// One cached tool list.
#[derive(Debug, Clone)]
pub struct CachedTools {
    pub tools: Vec<McpTool>,
    pub method: DiscoveryMethod,
    pub cached_at: Instant,
    pub ttl: Duration,
    pub generation: u64,
}

impl CachedTools {
    pub fn age(&self) -> Duration {
        self.cached_at.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }

    /// Fresh but inside the last 10% of its TTL: serve stale, refresh in the
    /// background.
    pub fn needs_revalidation(&self) -> bool {
        self.is_fresh() && self.age().as_secs_f64() >= self.ttl.as_secs_f64() * REVALIDATE_THRESHOLD
    }
}

#[derive(Default)]
pub struct ToolCache {
    entries: DashMap<String, CachedTools>,
    /// Per-key single-flight locks.
    flights: DashMap<String, Arc<Mutex<()>>>,
    /// Bumped on every invalidation; entries from older generations are
    /// already gone, the counter exists so flights can detect races.
    generation: AtomicU64,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, template_id: &str) -> Option<CachedTools> {
        self.entries.get(template_id).map(|e| e.clone())
    }

    pub fn insert(
        &self,
        template_id: &str,
        tools: Vec<McpTool>,
        method: DiscoveryMethod,
        ttl: Duration,
    ) {
        self.entries.insert(
            template_id.to_string(),
            CachedTools {
                tools,
                method,
                cached_at: Instant::now(),
                ttl,
                generation: self.generation.load(Ordering::SeqCst),
            },
        );
    }

    /// Drop an entry (explicit refresh or template change).
    pub fn invalidate(&self, template_id: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.entries.remove(template_id).is_some() {
            tracing::debug!(template = %template_id, "tool cache invalidated");
        }
    }

    /// Extend an entry's lifetime after a failed background revalidation;
    /// the stale value stays served and the next access retries.
    pub fn extend(&self, template_id: &str, grace: Duration) {
        if let Some(mut entry) = self.entries.get_mut(template_id) {
            entry.cached_at += grace;
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The single-flight lock for a template key.
    pub fn flight_lock(&self, template_id: &str) -> Arc<Mutex<()>> {
        self.flights
            .entry(template_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
