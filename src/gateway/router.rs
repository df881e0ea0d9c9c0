//! Gateway router — the authenticated HTTP surface.
//!
//! Every `/mcp/{template}/...` request resolves the template, asks the load
//! balancer for a healthy instance, and forwards the mapped JSON-RPC call
//! over the instance's transport. Responses come back verbatim — a tool
//! result carrying `isError: true` is still a 200; transport-level failures
//! map to the gateway status-code contract. Failed attempts are retried with
//! exponential backoff against other instances, excluding every instance
//! already tried for this request.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use crate::connection::HttpConnection;
use crate::error::StevedoreError;
use crate::gateway::balancer::{BalancerConfig, LoadBalancer};
use crate::gateway::pool::{StdioPoolConfig, StdioPools};
use crate::gateway::registry::{Endpoint, GatewayRegistry, InstanceRecord, TemplateRouting};
use crate::protocol::{METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST};
use crate::template::Transport;

/// Gateway authentication modes.
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// No authentication; every request passes.
    Open,
    /// `Authorization: Bearer <token>` against a token set.
    Bearer { tokens: HashSet<String> },
    /// API key header against a key set.
    ApiKey { keys: HashSet<String> },
}

/// Header carrying the API key in `AuthMode::ApiKey`.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub auth: AuthMode,
    /// Per-request wall clock; expiry returns 504.
    pub request_timeout: Duration,
    pub pool: StdioPoolConfig,
    /// Per-attempt timeout for upstream calls.
    pub upstream_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            auth: AuthMode::Open,
            request_timeout: Duration::from_secs(60),
            pool: StdioPoolConfig::default(),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct TemplateStats {
    requests: AtomicU64,
    errors: AtomicU64,
}

/// Router-maintained per-template counters for `/gateway/stats`.
#[derive(Default)]
pub struct GatewayStats {
    templates: DashMap<String, TemplateStats>,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
}

impl GatewayStats {
    fn record(&self, template: &str, ok: bool) {
        let entry = self.templates.entry(template.to_string()).or_default();
        entry.requests.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            entry.errors.fetch_add(1, Ordering::Relaxed);
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> Value {
        let per_template: serde_json::Map<String, Value> = self
            .templates
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    serde_json::json!({
                        "requests": entry.requests.load(Ordering::Relaxed),
                        "errors": entry.errors.load(Ordering::Relaxed),
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_errors": self.total_errors.load(Ordering::Relaxed),
            "templates": per_template,
        })
    }
}

/// Shared state behind the axum router.
pub struct GatewayState {
    pub registry: Arc<GatewayRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub pools: Arc<StdioPools>,
    pub client: reqwest::Client,
    pub config: RouterConfig,
    pub stats: Arc<GatewayStats>,
    started_at: Instant,
}

impl GatewayState {
    pub fn new(registry: Arc<GatewayRegistry>, config: RouterConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            balancer: Arc::new(LoadBalancer::new()),
            pools: Arc::new(StdioPools::new(config.pool.clone())),
            client: reqwest::Client::new(),
            config,
            stats: Arc::new(GatewayStats::default()),
            started_at: Instant::now(),
        })
    }
}

/// Build the gateway's route family.
pub fn gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/mcp/:template/tools/list", get(tools_list))
        .route("/mcp/:template/tools/call", post(tools_call))
        .route("/mcp/:template/resources/list", get(resources_list))
        .route("/mcp/:template/resources/read", post(resources_read))
        .route("/mcp/:template/health", get(template_health))
        .route("/gateway/health", get(gateway_health))
        .route("/gateway/registry", get(gateway_registry))
        .route("/gateway/stats", get(gateway_stats))
        .route("/gateway/register", post(gateway_register))
        .route(
            "/gateway/deregister/:template/:instance_id",
            delete(gateway_deregister),
        )
        .with_state(state)
}

// --- error plumbing ---------------------------------------------------------

fn error_body(kind: &str, message: String, details: Value) -> Value {
    serde_json::json!({"error": {"type": kind, "message": message, "details": details}})
}

fn status_for(error: &StevedoreError) -> StatusCode {
    match error {
        StevedoreError::TemplateNotFound(_) | StevedoreError::DeploymentNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        StevedoreError::InvalidConfiguration(..)
        | StevedoreError::InvalidTemplate(..)
        | StevedoreError::ReservedEnvVar(_) => StatusCode::BAD_REQUEST,
        StevedoreError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        StevedoreError::NoHealthyInstances(_) | StevedoreError::QueueFull(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        StevedoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        StevedoreError::Protocol(..)
        | StevedoreError::ConnectionClosed(_)
        | StevedoreError::ToolExecution(..)
        | StevedoreError::BackendUnavailable(..) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &StevedoreError, attempts: &[String]) -> Response {
    let status = status_for(error);
    let mut headers = HeaderMap::new();
    if let Some(last) = attempts.last() {
        if let Ok(value) = HeaderValue::from_str(last) {
            headers.insert("x-instance-id", value);
        }
    }
    if !attempts.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&attempts.len().to_string()) {
            headers.insert("x-attempts", value);
        }
        if let Ok(value) = HeaderValue::from_str(&attempts.join(",")) {
            headers.insert("x-attempt-instances", value);
        }
    }
    let details = serde_json::json!({"attempts": attempts});
    (
        status,
        headers,
        Json(error_body(error.kind(), error.to_string(), details)),
    )
        .into_response()
}

fn authenticate(state: &GatewayState, headers: &HeaderMap) -> crate::Result<()> {
    match &state.config.auth {
        AuthMode::Open => Ok(()),
        AuthMode::Bearer { tokens } => {
            let presented = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .unwrap_or("");
            if tokens.contains(presented) {
                Ok(())
            } else {
                Err(StevedoreError::AuthFailed(
                    "invalid or missing bearer token".to_string(),
                ))
            }
        }
        AuthMode::ApiKey { keys } => {
            let presented = headers
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if keys.contains(presented) {
                Ok(())
            } else {
                Err(StevedoreError::AuthFailed(
                    "invalid or missing API key".to_string(),
                ))
            }
        }
    }
}

// --- forwarding core --------------------------------------------------------

/// Which calls may be re-sent after the request body was transmitted.
#[derive(Clone, Copy, PartialEq)]
enum Idempotency {
    /// Safe to retry on any transport failure (list operations).
    Retryable,
    /// Retried only on connection-establishment errors (tool calls).
    ConnectOnly,
}

async fn forward(
    state: &GatewayState,
    template: &str,
    method: &str,
    params: Option<Value>,
    idempotency: Idempotency,
) -> Response {
    // Attempts are recorded outside the forwarding future so a wall-clock
    // timeout can still name the instance it was waiting on.
    let attempted: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let result = tokio::time::timeout(
        state.config.request_timeout,
        forward_with_retries(state, template, method, params, idempotency, attempted.clone()),
    )
    .await;

    let response = match result {
        Ok(response) => response,
        Err(_elapsed) => {
            let error = StevedoreError::Timeout(template.to_string());
            let attempts = attempted.lock().expect("attempt log poisoned").clone();
            error_response(&error, &attempts)
        }
    };
    state
        .stats
        .record(template, response.status().is_success());
    response
}

async fn forward_with_retries(
    state: &GatewayState,
    template: &str,
    method: &str,
    params: Option<Value>,
    idempotency: Idempotency,
    attempted: Arc<std::sync::Mutex<Vec<String>>>,
) -> Response {
    let Some(routing) = state.registry.routing(template).await else {
        return error_response(&StevedoreError::TemplateNotFound(template.to_string()), &[]);
    };

    let max_retries = routing.policy.max_retries;
    let backoff_base = Duration::from_millis(routing.policy.backoff_base_ms.max(1));
    let mut excluded: HashSet<String> = HashSet::new();
    let mut attempts: Vec<String> = Vec::new();
    let mut last_error = StevedoreError::NoHealthyInstances(template.to_string());

    for attempt in 0..=max_retries {
        let instance = match state.balancer.select(template, &routing, &excluded) {
            Ok(instance) => instance,
            Err(e) => {
                // Nothing left to try (or nothing healthy at all).
                let error = if attempts.is_empty() { e } else { last_error };
                return error_response(&error, &attempts);
            }
        };
        attempts.push(instance.instance_id.clone());
        attempted
            .lock()
            .expect("attempt log poisoned")
            .push(instance.instance_id.clone());

        let _active = state.balancer.acquire(&instance.instance_id);
        match dispatch(state, &instance, method, params.clone()).await {
            Ok(result) => {
                return success_response(&instance, &routing, &attempts, result);
            }
            Err(error) => {
                tracing::warn!(
                    template = %template,
                    instance = %instance.instance_id,
                    attempt = attempt + 1,
                    error = %error,
                    "forwarding attempt failed"
                );
                let retryable = match idempotency {
                    Idempotency::Retryable => is_retryable_failure(&error),
                    Idempotency::ConnectOnly => {
                        matches!(error, StevedoreError::ConnectionClosed(_))
                    }
                };
                last_error = error;
                if !retryable || attempt == max_retries {
                    return error_response(&last_error, &attempts);
                }
                // The failed instance is out for the remainder of this request.
                excluded.insert(instance.instance_id.clone());
                tokio::time::sleep(backoff_with_jitter(backoff_base, attempt)).await;
            }
        }
    }
    error_response(&last_error, &attempts)
}

/// Exponential backoff (factor 2) with 50% jitter.
fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    exp.mul_f64(jitter)
}

/// Transport failures and upstream 5xx are retryable for idempotent calls.
fn is_retryable_failure(error: &StevedoreError) -> bool {
    if error.is_retryable() {
        return true;
    }
    matches!(error, StevedoreError::Protocol(_, msg) if msg.contains("HTTP 5"))
}

async fn dispatch(
    state: &GatewayState,
    instance: &InstanceRecord,
    method: &str,
    params: Option<Value>,
) -> crate::Result<Value> {
    match instance.transport {
        Transport::Http => {
            let Endpoint::Http { ref url } = instance.endpoint else {
                return Err(StevedoreError::Protocol(
                    instance.instance_id.clone(),
                    "http instance with non-http endpoint".to_string(),
                ));
            };
            let session = HttpConnection::new(
                instance.instance_id.clone(),
                url.clone(),
                state.client.clone(),
                state.config.upstream_timeout,
            );
            session.request(method, params).await
        }
        Transport::Stdio => {
            let session = state.pools.acquire(instance).await?;
            session.request(method, params).await
        }
    }
}

fn success_response(
    instance: &InstanceRecord,
    routing: &TemplateRouting,
    attempts: &[String],
    result: Value,
) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&instance.instance_id) {
        headers.insert("x-instance-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&routing.policy.strategy.to_string()) {
        headers.insert("x-strategy", value);
    }
    if attempts.len() > 1 {
        if let Ok(value) = HeaderValue::from_str(&attempts.join(",")) {
            headers.insert("x-attempt-instances", value);
        }
        if let Ok(value) = HeaderValue::from_str(&attempts.len().to_string()) {
            headers.insert("x-attempts", value);
        }
    }
    (StatusCode::OK, headers, Json(result)).into_response()
}

// --- /mcp handlers ----------------------------------------------------------

async fn tools_list(
    State(state): State<Arc<GatewayState>>,
    Path(template): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate(&state, &headers) {
        return error_response(&e, &[]);
    }
    forward(&state, &template, METHOD_TOOLS_LIST, None, Idempotency::Retryable).await
}

async fn tools_call(
    State(state): State<Arc<GatewayState>>,
    Path(template): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(e) = authenticate(&state, &headers) {
        return error_response(&e, &[]);
    }
    if body.get("name").and_then(Value::as_str).is_none() {
        let error = StevedoreError::InvalidConfiguration(
            "name".to_string(),
            "tools/call body requires a tool name".to_string(),
        );
        return error_response(&error, &[]);
    }
    forward(
        &state,
        &template,
        METHOD_TOOLS_CALL,
        Some(body),
        Idempotency::ConnectOnly,
    )
    .await
}

async fn resources_list(
    State(state): State<Arc<GatewayState>>,
    Path(template): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate(&state, &headers) {
        return error_response(&e, &[]);
    }
    forward(
        &state,
        &template,
        METHOD_RESOURCES_LIST,
        None,
        Idempotency::Retryable,
    )
    .await
}

async fn resources_read(
    State(state): State<Arc<GatewayState>>,
    Path(template): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(e) = authenticate(&state, &headers) {
        return error_response(&e, &[]);
    }
    if body.get("uri").and_then(Value::as_str).is_none() {
        let error = StevedoreError::InvalidConfiguration(
            "uri".to_string(),
            "resources/read body requires a uri".to_string(),
        );
        return error_response(&error, &[]);
    }
    forward(
        &state,
        &template,
        METHOD_RESOURCES_READ,
        Some(body),
        Idempotency::Retryable,
    )
    .await
}

/// Health routes stay unauthenticated.
async fn template_health(
    State(state): State<Arc<GatewayState>>,
    Path(template): Path<String>,
) -> Response {
    let Some(routing) = state.registry.routing(&template).await else {
        return error_response(&StevedoreError::TemplateNotFound(template), &[]);
    };
    let healthy = routing.instances.iter().filter(|i| i.is_healthy()).count();
    let instances: Vec<Value> = routing
        .instances
        .iter()
        .map(|i| {
            serde_json::json!({
                "instance_id": i.instance_id,
                "status": i.status,
                "consecutive_failures": i.consecutive_failures,
                "last_check": i.last_check,
            })
        })
        .collect();
    Json(serde_json::json!({
        "template": template,
        "healthy": healthy,
        "total": routing.instances.len(),
        "instances": instances,
    }))
    .into_response()
}

// --- /gateway handlers ------------------------------------------------------

async fn gateway_health(State(state): State<Arc<GatewayState>>) -> Response {
    let snapshot = state.registry.snapshot().await;
    let instance_count: usize = snapshot.templates.values().map(|r| r.instances.len()).sum();
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "templates": snapshot.templates.len(),
        "instances": instance_count,
    }))
    .into_response()
}

async fn gateway_registry(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate(&state, &headers) {
        return error_response(&e, &[]);
    }
    let snapshot = state.registry.snapshot().await;
    Json(serde_json::to_value(snapshot).unwrap_or(Value::Null)).into_response()
}

async fn gateway_stats(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    if let Err(e) = authenticate(&state, &headers) {
        return error_response(&e, &[]);
    }
    Json(state.stats.snapshot()).into_response()
}

#[derive(Deserialize)]
struct RegisterBody {
    #[serde(flatten)]
    instance: InstanceRecord,
    #[serde(default)]
    policy: Option<BalancerConfig>,
}

async fn gateway_register(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> Response {
    if let Err(e) = authenticate(&state, &headers) {
        return error_response(&e, &[]);
    }
    let template = body.instance.template_id.clone();
    let instance_id = body.instance.instance_id.clone();
    match state.registry.register(body.instance, body.policy).await {
        Ok(()) => {
            tracing::info!(template = %template, instance = %instance_id, "instance registered");
            Json(serde_json::json!({"registered": instance_id, "template": template}))
                .into_response()
        }
        Err(e) => error_response(&e, &[]),
    }
}

async fn gateway_deregister(
    State(state): State<Arc<GatewayState>>,
    Path((template, instance_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authenticate(&state, &headers) {
        return error_response(&e, &[]);
    }
    match state.registry.deregister(&template, &instance_id).await {
        Ok(true) => {
            state.pools.remove_instance(&instance_id);
            tracing::info!(template = %template, instance = %instance_id, "instance deregistered");
            Json(serde_json::json!({"deregistered": instance_id})).into_response()
        }
        Ok(false) => error_response(
            &StevedoreError::DeploymentNotFound(instance_id.clone()),
            &[],
        ),
        Err(e) => error_response(&e, &[]),
    }
}
