//! Tool discovery — the four-tier cascade.
//!
//! `discover` answers "what tools does template X expose?" by falling through
//! cache hit → live HTTP probe of a running deployment → ephemeral stdio
//! spawn → static template metadata. Each failing tier is logged and the
//! cascade proceeds; the call itself never fails. Concurrent calls for one
//! template coalesce onto a single in-flight probe, and entries near the end
//! of their TTL are served stale while a background refresh runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backend::{DeploymentFilter, DeploymentStatus};
use crate::connection::Connection;
use crate::deploy::DeploymentManager;
use crate::protocol::McpTool;
use crate::template::{RegistryHandle, TemplateDescriptor, Transport};
use crate::tools::cache::{
    DiscoveryMethod, ToolCache, DEFAULT_TTL, REVALIDATE_GRACE, STATIC_TTL,
};

/// Default timeout for the live HTTP probe.
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the ephemeral stdio probe.
pub const STDIO_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    /// Bypass the cache and re-run the live tiers.
    pub refresh: bool,
    pub http_timeout: Duration,
    pub stdio_timeout: Duration,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            refresh: false,
            http_timeout: HTTP_PROBE_TIMEOUT,
            stdio_timeout: STDIO_PROBE_TIMEOUT,
        }
    }
}

/// Result of one discover call.
#[derive(Debug, Clone, Serialize)]
pub struct Discovery {
    pub tools: Vec<McpTool>,
    pub method: DiscoveryMethod,
    /// Endpoint or image the tools came from, when a live tier answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

pub struct ToolManager {
    templates: RegistryHandle,
    manager: Arc<DeploymentManager>,
    cache: Arc<ToolCache>,
    client: reqwest::Client,
}

impl ToolManager {
    pub fn new(templates: RegistryHandle, manager: Arc<DeploymentManager>) -> Self {
        Self {
            templates,
            manager,
            cache: Arc::new(ToolCache::new()),
            client: reqwest::Client::new(),
        }
    }

    pub fn cache(&self) -> &Arc<ToolCache> {
        &self.cache
    }

    /// Enumerate a template's tools through the cascade. Never fails: if
    /// every tier fails the result is `{tools: [], method: none}`.
    pub async fn discover(self: &Arc<Self>, template_id: &str, options: DiscoverOptions) -> Discovery {
        let template = match self.templates.read().await.get(template_id) {
            Ok(template) => template,
            Err(e) => {
                tracing::warn!(template = %template_id, error = %e, "discover on unknown template");
                return Discovery {
                    tools: Vec::new(),
                    method: DiscoveryMethod::None,
                    source: None,
                };
            }
        };

        // Tier 1: fresh cache hit.
        if !options.refresh {
            if let Some(entry) = self.cache.get(template_id) {
                if entry.is_fresh() {
                    if entry.needs_revalidation() {
                        self.schedule_revalidation(template.clone(), options.clone());
                    }
                    return Discovery {
                        tools: entry.tools,
                        method: DiscoveryMethod::Cache,
                        source: None,
                    };
                }
            }
        }

        // Single flight: one probe per template at a time. Whoever waited on
        // the lock takes the winner's cache entry instead of probing again.
        let wait_start = Instant::now();
        let lock = self.cache.flight_lock(template_id);
        let _guard = lock.lock().await;
        if let Some(entry) = self.cache.get(template_id) {
            if entry.is_fresh() && entry.cached_at >= wait_start {
                return Discovery {
                    tools: entry.tools,
                    method: DiscoveryMethod::Cache,
                    source: None,
                };
            }
        }

        match self.probe_live(&template, &options).await {
            Ok((tools, method, source)) => {
                self.cache
                    .insert(template_id, tools.clone(), method, DEFAULT_TTL);
                Discovery {
                    tools,
                    method,
                    source,
                }
            }
            Err(reason) => {
                tracing::debug!(template = %template_id, %reason, "live tiers failed, using static metadata");
                let tools = template.tools.clone();
                self.cache
                    .insert(template_id, tools.clone(), DiscoveryMethod::Static, STATIC_TTL);
                Discovery {
                    tools,
                    method: DiscoveryMethod::Static,
                    source: None,
                }
            }
        }
    }

    /// Tiers 2 and 3; returns the failure reason when both miss.
    async fn probe_live(
        &self,
        template: &TemplateDescriptor,
        options: &DiscoverOptions,
    ) -> Result<(Vec<McpTool>, DiscoveryMethod, Option<String>), String> {
        // Tier 2: a running deployment with HTTP transport.
        match self.http_probe(template, options.http_timeout).await {
            Ok(Some((tools, endpoint))) => {
                tracing::debug!(template = %template.id, endpoint = %endpoint, "tools discovered over http");
                return Ok((tools, DiscoveryMethod::Http, Some(endpoint)));
            }
            Ok(None) => {
                tracing::debug!(template = %template.id, "no running http deployment to probe");
            }
            Err(e) => {
                tracing::warn!(template = %template.id, error = %e, "http discovery tier failed");
            }
        }

        // Tier 3: ephemeral stdio spawn.
        if template.supports_transport(Transport::Stdio) {
            match self.stdio_probe(template, options.stdio_timeout).await {
                Ok(tools) => {
                    tracing::debug!(template = %template.id, "tools discovered over stdio");
                    return Ok((tools, DiscoveryMethod::Stdio, Some(template.image.clone())));
                }
                Err(e) => {
                    tracing::warn!(template = %template.id, error = %e, "stdio discovery tier failed");
                }
            }
        }

        Err("no live tier produced tools".to_string())
    }

    async fn http_probe(
        &self,
        template: &TemplateDescriptor,
        timeout: Duration,
    ) -> crate::Result<Option<(Vec<McpTool>, String)>> {
        let deployments = self
            .manager
            .list(&DeploymentFilter {
                template_id: Some(template.id.clone()),
                include_stopped: false,
            })
            .await?;
        let Some(endpoint) = deployments
            .iter()
            .filter(|d| d.status == DeploymentStatus::Running && d.transport == Transport::Http)
            .find_map(|d| d.endpoint_url())
        else {
            return Ok(None);
        };

        let session = Connection::http(
            template.id.clone(),
            endpoint.clone(),
            self.client.clone(),
            timeout,
        );
        let tools = session.list_tools().await?;
        Ok(Some((tools, endpoint)))
    }

    async fn stdio_probe(
        &self,
        template: &TemplateDescriptor,
        timeout: Duration,
    ) -> crate::Result<Vec<McpTool>> {
        let spec = self.manager.stdio_probe_spec(&template.id).await?;
        let session = Connection::stdio(template.id.clone(), &spec, timeout)?;
        let outcome = tokio::time::timeout(timeout, async {
            session.initialize().await?;
            session.list_tools().await
        })
        .await;
        session.close().await;
        match outcome {
            Ok(result) => result,
            Err(_elapsed) => Err(crate::error::StevedoreError::Timeout(template.id.clone())),
        }
    }

    /// Stale-while-revalidate: refresh the entry in the background. A failed
    /// refresh extends the stale entry by the grace period instead of
    /// evicting it.
    fn schedule_revalidation(self: &Arc<Self>, template: Arc<TemplateDescriptor>, options: DiscoverOptions) {
        let manager = self.clone();
        tokio::spawn(async move {
            let lock = manager.cache.flight_lock(&template.id);
            let Ok(_guard) = lock.try_lock() else {
                // A refresh is already in flight.
                return;
            };
            match manager.probe_live(&template, &options).await {
                Ok((tools, method, _source)) => {
                    manager.cache.insert(&template.id, tools, method, DEFAULT_TTL);
                    tracing::debug!(template = %template.id, "background revalidation refreshed tools");
                }
                Err(reason) => {
                    tracing::debug!(template = %template.id, %reason, "background revalidation failed, extending entry");
                    manager.cache.extend(&template.id, REVALIDATE_GRACE);
                }
            }
        });
    }

    /// Invalidate cached tools for changed templates (hot-reload hook).
    pub fn invalidate_templates(&self, template_ids: &[String]) {
        for template_id in template_ids {
            self.cache.invalidate(template_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendKind};
    use crate::config::ConfigLayers;
    use crate::deploy::DeployOptions;
    use crate::template::{registry_handle, TemplateRegistry};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn write_template(root: &std::path::Path, with_stdio: bool) {
        let supported = if with_stdio {
            r#"["http", "stdio"]"#
        } else {
            r#"["http"]"#
        };
        let dir = root.join("demo");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("template.json"),
            format!(
                r#"{{
                    "id": "demo",
                    "name": "Demo",
                    "version": "1.0.0",
                    "image": "example/demo:1.0.0",
                    "port": 8080,
                    "transport": {{"default": "http", "supported": {supported}}},
                    "config_schema": {{"properties": {{}}}},
                    "tools": [{{"name": "say_hello", "description": "Greets"}}]
                }}"#
            ),
        )
        .unwrap();
    }

    struct Fixture {
        tools: Arc<ToolManager>,
        manager: Arc<DeploymentManager>,
    }

    fn fixture(tmp: &TempDir, with_stdio: bool) -> Fixture {
        write_template(tmp.path(), with_stdio);
        let templates = registry_handle(TemplateRegistry::discover(tmp.path()).unwrap());
        let backend = Arc::new(Backend::new(BackendKind::Mock, "stevedore-mcp", None));
        let manager = Arc::new(DeploymentManager::new(templates.clone(), backend));
        let tools = Arc::new(ToolManager::new(templates, manager.clone()));
        Fixture { tools, manager }
    }

    /// MCP responder exposing the given tool names, counting tools/list hits.
    async fn serve_tools(names: Vec<&'static str>, hits: Arc<AtomicUsize>) -> u16 {
        let app = Router::new().route(
            "/mcp",
            post(move |Json(request): Json<Value>| {
                let hits = hits.clone();
                let names = names.clone();
                async move {
                    let id = request["id"].clone();
                    let result = match request["method"].as_str().unwrap_or("") {
                        "tools/list" => {
                            hits.fetch_add(1, Ordering::SeqCst);
                            let tools: Vec<Value> = names
                                .iter()
                                .map(|n| serde_json::json!({"name": n}))
                                .collect();
                            serde_json::json!({"tools": tools})
                        }
                        _ => serde_json::json!({}),
                    };
                    Json(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_static_fallback_when_nothing_runs() {
        let tmp = TempDir::new().unwrap();
        let f = fixture(&tmp, false);

        let discovery = f.tools.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(discovery.method, DiscoveryMethod::Static);
        assert_eq!(discovery.tools.len(), 1);
        assert_eq!(discovery.tools[0].name, "say_hello");
    }

    #[tokio::test]
    async fn test_cache_cascade_static_then_http_then_cache() {
        let tmp = TempDir::new().unwrap();
        let f = fixture(&tmp, false);

        // No deployment: static metadata answers.
        let discovery = f.tools.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(discovery.method, DiscoveryMethod::Static);

        // Start an HTTP deployment exposing a richer tool set.
        let hits = Arc::new(AtomicUsize::new(0));
        let port = serve_tools(vec!["say_hello", "echo"], hits).await;
        f.manager
            .deploy(
                "demo",
                &ConfigLayers::default(),
                DeployOptions {
                    port: Some(port),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let discovery = f
            .tools
            .discover(
                "demo",
                DiscoverOptions {
                    refresh: true,
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(discovery.method, DiscoveryMethod::Http);
        let names: Vec<&str> = discovery.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["say_hello", "echo"]);

        // Within the TTL the cache answers.
        let discovery = f.tools.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(discovery.method, DiscoveryMethod::Cache);
        assert_eq!(discovery.tools.len(), 2);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_probes() {
        let tmp = TempDir::new().unwrap();
        let f = fixture(&tmp, false);

        let hits = Arc::new(AtomicUsize::new(0));
        let port = serve_tools(vec!["say_hello"], hits.clone()).await;
        f.manager
            .deploy(
                "demo",
                &ConfigLayers::default(),
                DeployOptions {
                    port: Some(port),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let tools = f.tools.clone();
            handles.push(tokio::spawn(async move {
                tools
                    .discover(
                        "demo",
                        DiscoverOptions {
                            refresh: true,
                            ..Default::default()
                        },
                    )
                    .await
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        // One probe served everyone.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        for discovery in &results {
            assert_eq!(discovery.tools.len(), 1);
            assert_eq!(discovery.tools[0].name, "say_hello");
        }
        assert_eq!(
            results
                .iter()
                .filter(|d| d.method == DiscoveryMethod::Http)
                .count(),
            1,
            "exactly one caller ran the live probe"
        );
    }

    #[tokio::test]
    async fn test_unknown_template_returns_none_method() {
        let tmp = TempDir::new().unwrap();
        let f = fixture(&tmp, false);
        let discovery = f.tools.discover("ghost", DiscoverOptions::default()).await;
        assert_eq!(discovery.method, DiscoveryMethod::None);
        assert!(discovery.tools.is_empty());
    }

    #[tokio::test]
    async fn test_stdio_tier_failure_falls_to_static() {
        // Template supports stdio but the mock backend's exec spec points at
        // a nonexistent program, so tier 3 fails and static answers.
        let tmp = TempDir::new().unwrap();
        let f = fixture(&tmp, true);
        let discovery = f.tools.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(discovery.method, DiscoveryMethod::Static);
        assert_eq!(discovery.tools[0].name, "say_hello");
    }

    #[tokio::test]
    async fn test_invalidation_forces_reprobe() {
        let tmp = TempDir::new().unwrap();
        let f = fixture(&tmp, false);

        let discovery = f.tools.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(discovery.method, DiscoveryMethod::Static);
        let discovery = f.tools.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(discovery.method, DiscoveryMethod::Cache);

        f.tools.invalidate_templates(&["demo".to_string()]);
        let discovery = f.tools.discover("demo", DiscoverOptions::default()).await;
        assert_eq!(
            discovery.method,
            DiscoveryMethod::Static,
            "invalidation evicts the cached entry"
        );
    }
}
