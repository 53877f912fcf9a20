//! The JSON-over-HTTP surface.
//!
//! A thin collaborator: every handler parses, calls one kernel operation,
//! and wraps the result. Policy lives below this layer. Every request
//! passes through the activity middleware so background work defers while
//! the user is active.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use helion_gateway::{GenerateRequestOpts, GenerationOutcome};
use helion_guard::{AppType, Capability};
use helion_kernel::{AppEntry, BrowseQuery, KernelError};
use helion_sandbox::LaunchOptions;

use crate::kernel::Kernel;

type AppState = Arc<Kernel>;

/// Build the router over a booted kernel.
pub fn router(kernel: AppState) -> Router {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/analyze", post(analyze))
        .route("/api/status", get(status))
        .route("/api/storage/:app_id", get(storage_overview))
        .route(
            "/api/storage/:app_id/:key",
            get(storage_get).put(storage_set).delete(storage_remove),
        )
        .route("/api/process/build", post(process_build))
        .route("/api/process/launch", post(process_launch))
        .route("/api/process/stop", post(process_stop))
        .route("/api/process/status/:app_id", get(process_status))
        .route("/api/process/logs/:app_id", get(process_logs))
        .route("/api/process/list", get(process_list))
        .route("/api/registry/browse", get(registry_browse))
        .route("/api/registry/search", get(registry_search))
        .route("/api/registry/publish", post(registry_publish))
        .route("/api/registry/tags", get(registry_tags))
        .route("/api/registry/stats", get(registry_stats))
        .route("/api/registry/sync", post(registry_sync))
        .route("/api/registry/launch/:hash", post(registry_launch))
        .route(
            "/api/registry/:hash",
            get(registry_get).delete(registry_delete),
        )
        .route("/api/registry/:hash/rate", post(registry_rate))
        .route("/api/registry/:hash/spec", put(registry_spec))
        .route("/api/scheduler/tasks", get(scheduler_tasks))
        .route("/api/scheduler/enable", post(scheduler_enable))
        .route("/api/scheduler/disable", post(scheduler_disable))
        .route("/api/scheduler/run", post(scheduler_run))
        .route("/api/scheduler/history/:id", get(scheduler_history))
        .route("/api/scheduler/pause", post(scheduler_pause))
        .route("/api/scheduler/resume", post(scheduler_resume))
        .route("/api/scheduler/reset", post(scheduler_reset))
        .route("/api/profile", get(profile_get).put(profile_put))
        .route("/api/profile/solidify", post(profile_solidify))
        .route("/api/profile/ephemeral", post(profile_ephemeral))
        .route("/api/profile/snapshot", get(profile_snapshot))
        .route("/api/shell/versions", get(shell_list).post(shell_save))
        .route("/api/shell/activate", post(shell_activate))
        .route("/api/shell/current", get(shell_current))
        .route("/api/queue", get(queue_list).post(queue_enqueue))
        .route("/api/wasm/launch", post(wasm_launch))
        .route("/api/wasm/kill", post(wasm_kill))
        .route("/api/wasm/list", get(wasm_list))
        .layer(middleware::from_fn_with_state(
            kernel.clone(),
            record_activity,
        ))
        // Storage quotas are enforced by the kernel; the transport limit
        // only has to be above them so the kernel is the one that answers.
        .layer(axum::extract::DefaultBodyLimit::max(16 * 1024 * 1024))
        .with_state(kernel)
}

/// Every API hit counts as user activity.
async fn record_activity(
    State(kernel): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    kernel.scheduler.record_activity();
    next.run(request).await
}

// ═══════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════

/// API error wrapper mapping kernel error kinds to status codes.
struct ApiError(KernelError);

type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        ApiError(err)
    }
}

impl From<helion_gateway::GatewayError> for ApiError {
    fn from(err: helion_gateway::GatewayError) -> Self {
        ApiError(err.into())
    }
}

impl From<helion_sandbox::SandboxError> for ApiError {
    fn from(err: helion_sandbox::SandboxError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            "validation" | "analysis_blocked" => StatusCode::BAD_REQUEST,
            "capability_denied" => StatusCode::FORBIDDEN,
            "quota_exceeded" => StatusCode::PAYLOAD_TOO_LARGE,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "provider_unavailable" | "resource_exhausted" => StatusCode::SERVICE_UNAVAILABLE,
            "provider_failed" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut body = json!({
            "ok": false,
            "error": kind,
            "message": self.0.to_string(),
        });
        if let KernelError::AnalysisBlocked { findings, .. } = &self.0 {
            body["findings"] = serde_json::to_value(findings).unwrap_or(Value::Null);
        }
        (status, Json(body)).into_response()
    }
}

fn blocked(report: &helion_guard::Report) -> KernelError {
    KernelError::AnalysisBlocked {
        critical_count: report.critical_count,
        findings: report.findings.clone(),
    }
}

fn ok(value: Value) -> Json<Value> {
    let mut body = json!({ "ok": true });
    if let Value::Object(map) = value {
        for (k, v) in map {
            body[k] = v;
        }
    }
    Json(body)
}

// ═══════════════════════════════════════════════════════════════════════
// GENERATION
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct GenerateBody {
    prompt: String,
    #[serde(default)]
    force: bool,
    /// Explicit substrate; the router decides when absent.
    #[serde(rename = "type")]
    app_type: Option<AppType>,
}

async fn generate(
    State(kernel): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> ApiResult<Json<Value>> {
    if body.prompt.trim().is_empty() {
        return Err(KernelError::Validation {
            reason: "prompt is empty".into(),
        }
        .into());
    }

    let classification = kernel.router.route(&body.prompt, &kernel.monitor).await;
    let app_type = body.app_type.unwrap_or(classification.app_type);

    match app_type {
        AppType::Process => {
            let result = kernel.gateway.generate_process(&body.prompt).await?;
            let recipe_report = kernel.analyzer.analyze_recipe(&result.dockerfile);
            let code_report = kernel.analyzer.analyze_code(&result.code);
            if !recipe_report.passed {
                return Err(blocked(&recipe_report).into());
            }
            Ok(ok(json!({
                "type": "process",
                "title": classification.title,
                "dockerfile": result.dockerfile,
                "code": result.code,
                "capabilities": result.capabilities,
                "provider": result.provider,
                "model": result.model,
                "analysis": { "recipe": recipe_report, "code": code_report },
                "sanitizer_flags": result.sanitizer_flags,
                "route_source": classification.source,
            })))
        }
        AppType::Iframe | AppType::Wasm => {
            let outcome = kernel
                .gateway
                .generate(&body.prompt, GenerateRequestOpts { force: body.force })
                .await?;
            let result = match outcome {
                GenerationOutcome::NeedsClarification(req) => {
                    return Ok(ok(json!({
                        "needs_clarification": true,
                        "questions": req.questions,
                        "confidence": req.confidence,
                    })));
                }
                GenerationOutcome::Generated(result) => result,
            };

            let report = kernel.analyzer.analyze_code(&result.code);
            if !report.passed {
                return Err(blocked(&report).into());
            }

            let published = kernel.registry.publish(AppEntry {
                hash: String::new(),
                prompt: result.prompt.clone(),
                normalized_prompt: String::new(),
                title: classification.title.clone(),
                app_type: AppType::Iframe,
                code: result.code.clone(),
                dockerfile: None,
                capabilities: result.capabilities.clone(),
                model: result.model.clone(),
                provider: result.provider.clone(),
                launches: 1,
                created_at: now_unix(),
                tags: Vec::new(),
                spec: None,
                rating: 0,
            })?;

            let grant = kernel
                .caps
                .grant(&published.hash, &result.capabilities);

            Ok(ok(json!({
                "type": "iframe",
                "app": published.entry,
                "existing": published.existing,
                "tokens": tokens_by_name(&grant.tokens),
                "analysis": report,
                "confidence": result.confidence,
                "sanitizer_flags": result.sanitizer_flags,
                "model_hint": result.model_hint,
                "route_source": classification.source,
            })))
        }
    }
}

#[derive(Deserialize)]
struct AnalyzeBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    dockerfile: Option<String>,
}

async fn analyze(
    State(kernel): State<AppState>,
    Json(body): Json<AnalyzeBody>,
) -> ApiResult<Json<Value>> {
    if body.code.is_none() && body.dockerfile.is_none() {
        return Err(KernelError::Validation {
            reason: "provide code and/or dockerfile".into(),
        }
        .into());
    }
    let code = body.code.map(|c| kernel.analyzer.analyze_code(&c));
    let recipe = body.dockerfile.map(|d| kernel.analyzer.analyze_recipe(&d));
    Ok(ok(json!({ "code": code, "recipe": recipe })))
}

async fn status(State(kernel): State<AppState>) -> Json<Value> {
    let providers = kernel.gateway_providers_status().await;
    Json(json!({
        "ok": true,
        "uptime_secs": now_unix().saturating_sub(kernel.started_at),
        "mode": kernel.profile.get().mode,
        "providers": providers,
        "models": kernel.monitor.models(),
        "registry": kernel.registry.stats(),
        "scheduler": kernel.scheduler.aggregate_stats(),
        "wasm_apps": kernel.wasm.list_apps().len(),
        "containers": kernel.processes.as_ref().map(|p| p.list().len()).unwrap_or(0),
        "notifications": kernel.notifications.lock().clone(),
    }))
}

// ═══════════════════════════════════════════════════════════════════════
// STORAGE
// ═══════════════════════════════════════════════════════════════════════

async fn storage_overview(
    State(kernel): State<AppState>,
    Path(app_id): Path<String>,
) -> Json<Value> {
    let usage = kernel.storage.usage(&app_id);
    Json(json!({
        "ok": true,
        "keys": kernel.storage.keys(&app_id),
        "usage": usage,
    }))
}

async fn storage_get(
    State(kernel): State<AppState>,
    Path((app_id, key)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    match kernel.storage.get(&app_id, &key) {
        Some(value) => Ok(ok(json!({ "value": value }))),
        None => Err(KernelError::NotFound {
            what: format!("key {key}"),
        }
        .into()),
    }
}

async fn storage_set(
    State(kernel): State<AppState>,
    Path((app_id, key)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> ApiResult<Json<Value>> {
    kernel.storage.set(&app_id, &key, value)?;
    Ok(ok(json!({})))
}

async fn storage_remove(
    State(kernel): State<AppState>,
    Path((app_id, key)): Path<(String, String)>,
) -> Json<Value> {
    let existed = kernel.storage.remove(&app_id, &key);
    Json(json!({ "ok": true, "existed": existed }))
}

// ═══════════════════════════════════════════════════════════════════════
// PROCESS APPS
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct ProcessBuildBody {
    app_id: String,
    dockerfile: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    context: HashMap<String, String>,
}

async fn process_build(
    State(kernel): State<AppState>,
    Json(body): Json<ProcessBuildBody>,
) -> ApiResult<Json<Value>> {
    let manager = kernel.process_manager()?;
    let report = kernel.analyzer.analyze_recipe(&body.dockerfile);
    if !report.passed {
        return Err(blocked(&report).into());
    }

    let mut context: Vec<(String, String)> = body.context.into_iter().collect();
    if let Some(code) = body.code {
        context.push(("app.js".to_string(), code));
    }
    let image = manager
        .build_image(&body.app_id, &body.dockerfile, &context)
        .await?;
    Ok(ok(json!({ "image": image, "analysis": report })))
}

#[derive(Deserialize)]
struct ProcessLaunchBody {
    app_id: String,
    image: String,
    #[serde(default)]
    capabilities: Vec<Capability>,
}

async fn process_launch(
    State(kernel): State<AppState>,
    Json(body): Json<ProcessLaunchBody>,
) -> ApiResult<Json<Value>> {
    let manager = kernel.process_manager()?;
    let grant = kernel.caps.grant(&body.app_id, &body.capabilities);
    let info = manager
        .launch(&body.app_id, &body.image, &grant.capabilities)
        .await?;
    Ok(ok(json!({
        "process": info,
        "tokens": tokens_by_name(&grant.tokens),
    })))
}

#[derive(Deserialize)]
struct AppIdBody {
    app_id: String,
}

async fn process_stop(
    State(kernel): State<AppState>,
    Json(body): Json<AppIdBody>,
) -> ApiResult<Json<Value>> {
    let manager = kernel.process_manager()?;
    manager.stop(&body.app_id).await?;
    kernel.caps.revoke_all(&body.app_id);
    Ok(ok(json!({})))
}

async fn process_status(
    State(kernel): State<AppState>,
    Path(app_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let manager = kernel.process_manager()?;
    let state = manager.health_check(&app_id).await?;
    let info = manager.get(&app_id);
    Ok(ok(json!({ "state": state, "process": info })))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_tail")]
    tail: usize,
}

fn default_tail() -> usize {
    100
}

async fn process_logs(
    State(kernel): State<AppState>,
    Path(app_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Value>> {
    let manager = kernel.process_manager()?;
    let logs = manager.get_logs(&app_id, query.tail).await?;
    Ok(ok(json!({ "logs": logs })))
}

async fn process_list(State(kernel): State<AppState>) -> ApiResult<Json<Value>> {
    let manager = kernel.process_manager()?;
    Ok(ok(json!({ "processes": manager.list() })))
}

// ═══════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════

async fn registry_browse(
    State(kernel): State<AppState>,
    Query(query): Query<BrowseQuery>,
) -> Json<Value> {
    let page = kernel.registry.browse(&query);
    Json(json!({ "ok": true, "apps": page.apps, "total": page.total, "offset": page.offset }))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

async fn registry_search(
    State(kernel): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<Value> {
    Json(json!({ "ok": true, "results": kernel.registry.search(&query.q) }))
}

#[derive(Deserialize)]
struct PublishBody {
    prompt: String,
    title: String,
    #[serde(rename = "type")]
    app_type: AppType,
    code: String,
    #[serde(default)]
    dockerfile: Option<String>,
    #[serde(default)]
    capabilities: Vec<Capability>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    provider: String,
    #[serde(default)]
    tags: Vec<String>,
}

async fn registry_publish(
    State(kernel): State<AppState>,
    Json(body): Json<PublishBody>,
) -> ApiResult<Json<Value>> {
    // The publish path is analyzer-gated like build and launch.
    if body.app_type != AppType::Process {
        let report = kernel.analyzer.analyze_code(&body.code);
        if !report.passed {
            return Err(blocked(&report).into());
        }
    }
    if let Some(recipe) = &body.dockerfile {
        let report = kernel.analyzer.analyze_recipe(recipe);
        if !report.passed {
            return Err(blocked(&report).into());
        }
    }

    let published = kernel.registry.publish(AppEntry {
        hash: String::new(),
        prompt: body.prompt,
        normalized_prompt: String::new(),
        title: body.title,
        app_type: body.app_type,
        code: body.code,
        dockerfile: body.dockerfile,
        capabilities: body.capabilities,
        model: body.model,
        provider: body.provider,
        launches: 1,
        created_at: now_unix(),
        tags: body.tags,
        spec: None,
        rating: 0,
    })?;
    Ok(ok(json!({ "hash": published.hash, "existing": published.existing, "app": published.entry })))
}

async fn registry_tags(State(kernel): State<AppState>) -> Json<Value> {
    let tags: Vec<Value> = kernel
        .registry
        .tags()
        .into_iter()
        .map(|(tag, count)| json!({ "tag": tag, "count": count }))
        .collect();
    Json(json!({ "ok": true, "tags": tags }))
}

async fn registry_stats(State(kernel): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "stats": kernel.registry.stats() }))
}

async fn registry_sync(State(kernel): State<AppState>) -> ApiResult<Json<Value>> {
    if kernel.args.community_index.is_empty() {
        return Err(KernelError::Validation {
            reason: "no community index configured".into(),
        }
        .into());
    }
    let imported = kernel
        .registry
        .sync_community(&kernel.args.community_index)
        .await;
    Ok(ok(json!({ "imported": imported })))
}

async fn registry_launch(
    State(kernel): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Value>> {
    let entry = kernel
        .registry
        .get(&hash)
        .ok_or_else(|| KernelError::NotFound {
            what: format!("app {hash}"),
        })?;
    let launches = kernel.registry.record_launch(&hash)?;
    let grant = kernel.caps.grant(&hash, &entry.capabilities);
    Ok(ok(json!({
        "app": entry,
        "launches": launches,
        "tokens": tokens_by_name(&grant.tokens),
    })))
}

async fn registry_get(
    State(kernel): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Value>> {
    match kernel.registry.get(&hash) {
        Some(entry) => Ok(ok(json!({ "app": entry }))),
        None => Err(KernelError::NotFound {
            what: format!("app {hash}"),
        }
        .into()),
    }
}

async fn registry_delete(
    State(kernel): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Value>> {
    kernel.registry.delete(&hash)?;
    kernel.caps.revoke_all(&hash);
    Ok(ok(json!({})))
}

#[derive(Deserialize)]
struct RateBody {
    delta: i32,
}

async fn registry_rate(
    State(kernel): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<RateBody>,
) -> ApiResult<Json<Value>> {
    let rating = kernel.registry.rate(&hash, body.delta)?;
    Ok(ok(json!({ "rating": rating })))
}

#[derive(Deserialize)]
struct SpecBody {
    spec: String,
}

async fn registry_spec(
    State(kernel): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<SpecBody>,
) -> ApiResult<Json<Value>> {
    kernel.registry.update_spec(&hash, &body.spec)?;
    Ok(ok(json!({})))
}

// ═══════════════════════════════════════════════════════════════════════
// SCHEDULER
// ═══════════════════════════════════════════════════════════════════════

async fn scheduler_tasks(State(kernel): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "tasks": kernel.scheduler.get_all(), "paused": kernel.scheduler.is_paused() }))
}

#[derive(Deserialize)]
struct TaskIdBody {
    id: String,
    #[serde(default)]
    interval_secs: Option<u64>,
}

async fn scheduler_enable(
    State(kernel): State<AppState>,
    Json(body): Json<TaskIdBody>,
) -> ApiResult<Json<Value>> {
    kernel.scheduler.enable(
        &body.id,
        body.interval_secs.map(std::time::Duration::from_secs),
    )?;
    Ok(ok(json!({})))
}

async fn scheduler_disable(
    State(kernel): State<AppState>,
    Json(body): Json<TaskIdBody>,
) -> ApiResult<Json<Value>> {
    kernel.scheduler.disable(&body.id)?;
    Ok(ok(json!({})))
}

async fn scheduler_run(
    State(kernel): State<AppState>,
    Json(body): Json<TaskIdBody>,
) -> ApiResult<Json<Value>> {
    let stats = kernel.scheduler.run_now(&body.id).await?;
    Ok(ok(json!({ "stats": stats })))
}

async fn scheduler_history(
    State(kernel): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(ok(json!({ "history": kernel.scheduler.history(&id)? })))
}

async fn scheduler_pause(State(kernel): State<AppState>) -> Json<Value> {
    kernel.scheduler.pause();
    Json(json!({ "ok": true, "paused": true }))
}

async fn scheduler_resume(State(kernel): State<AppState>) -> Json<Value> {
    kernel.scheduler.resume();
    Json(json!({ "ok": true, "paused": false }))
}

async fn scheduler_reset(
    State(kernel): State<AppState>,
    Json(body): Json<TaskIdBody>,
) -> ApiResult<Json<Value>> {
    kernel.scheduler.reset_circuit_breaker(&body.id)?;
    Ok(ok(json!({})))
}

// ═══════════════════════════════════════════════════════════════════════
// PROFILE / SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════

async fn profile_get(State(kernel): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "profile": kernel.profile.get() }))
}

async fn profile_put(
    State(kernel): State<AppState>,
    Json(profile): Json<helion_kernel::Profile>,
) -> ApiResult<Json<Value>> {
    kernel.profile.set(profile)?;
    Ok(ok(json!({})))
}

async fn profile_solidify(State(kernel): State<AppState>) -> ApiResult<Json<Value>> {
    let apps = kernel.registry.all();
    let shell = kernel.shell.current();
    let meta = kernel.profile.solidify(&apps, shell.as_deref())?;
    Ok(ok(json!({ "snapshot": meta })))
}

#[derive(Deserialize, Default)]
struct EphemeralBody {
    #[serde(default)]
    clear_snapshot: bool,
}

async fn profile_ephemeral(
    State(kernel): State<AppState>,
    body: Option<Json<EphemeralBody>>,
) -> ApiResult<Json<Value>> {
    let clear = body.map(|Json(b)| b.clear_snapshot).unwrap_or(false);
    kernel.profile.go_ephemeral(clear)?;
    Ok(ok(json!({ "cleared": clear })))
}

async fn profile_snapshot(State(kernel): State<AppState>) -> ApiResult<Json<Value>> {
    match kernel.profile.snapshot_meta() {
        Some(meta) => Ok(ok(json!({ "snapshot": meta }))),
        None => Err(KernelError::NotFound {
            what: "snapshot".into(),
        }
        .into()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SHELL VERSIONS / AGENT QUEUE
// ═══════════════════════════════════════════════════════════════════════

async fn shell_list(State(kernel): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "versions": kernel.shell.list(),
        "current": kernel.shell.current_id(),
    }))
}

#[derive(Deserialize)]
struct ShellSaveBody {
    html: String,
    #[serde(default = "default_origin")]
    origin: String,
    #[serde(default)]
    note: Option<String>,
}

fn default_origin() -> String {
    "manual".into()
}

async fn shell_save(
    State(kernel): State<AppState>,
    Json(body): Json<ShellSaveBody>,
) -> ApiResult<Json<Value>> {
    // Shell bodies go through the same gate as app bodies.
    let report = kernel.analyzer.analyze_code(&body.html);
    if !report.passed {
        return Err(blocked(&report).into());
    }
    let version = kernel.shell.save(&body.html, &body.origin, body.note)?;
    Ok(ok(json!({ "version": version, "analysis": report })))
}

#[derive(Deserialize)]
struct ShellActivateBody {
    id: String,
}

async fn shell_activate(
    State(kernel): State<AppState>,
    Json(body): Json<ShellActivateBody>,
) -> ApiResult<Json<Value>> {
    kernel.shell.activate(&body.id)?;
    Ok(ok(json!({})))
}

async fn shell_current(State(kernel): State<AppState>) -> ApiResult<Json<Value>> {
    match kernel.shell.current() {
        Some(html) => Ok(ok(json!({ "html": html, "id": kernel.shell.current_id() }))),
        None => Err(KernelError::NotFound {
            what: "active shell".into(),
        }
        .into()),
    }
}

async fn queue_list(State(kernel): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "tasks": kernel.queue.list() }))
}

#[derive(Deserialize)]
struct EnqueueBody {
    prompt: String,
}

async fn queue_enqueue(
    State(kernel): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<Json<Value>> {
    let task = kernel.queue.enqueue(&body.prompt)?;
    Ok(ok(json!({ "task": task })))
}

// ═══════════════════════════════════════════════════════════════════════
// WASM APPS
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct WasmLaunchBody {
    app_id: String,
    /// Base64-encoded module bytes.
    wasm: String,
    #[serde(default)]
    capabilities: Vec<Capability>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    entry_fn: Option<String>,
    #[serde(default)]
    args: Vec<i64>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    max_memory_pages: Option<u32>,
}

async fn wasm_launch(
    State(kernel): State<AppState>,
    Json(body): Json<WasmLaunchBody>,
) -> ApiResult<Json<Value>> {
    let bytes = BASE64.decode(&body.wasm).map_err(|e| KernelError::Validation {
        reason: format!("wasm is not valid base64: {e}"),
    })?;

    let grant = kernel.caps.grant(&body.app_id, &body.capabilities);
    let mut opts = LaunchOptions {
        args: body.args,
        tokens: grant.tokens.clone(),
        ..LaunchOptions::default()
    };
    if let Some(entry) = body.entry_fn {
        opts.entry_fn = entry;
    }
    if let Some(ms) = body.timeout_ms {
        opts.timeout_ms = ms;
    }
    if let Some(pages) = body.max_memory_pages {
        opts.max_memory_pages = pages;
    }

    let title = body.title.unwrap_or_else(|| body.app_id.clone());
    let result = kernel
        .wasm
        .launch(&body.app_id, bytes, grant.capabilities, &title, opts)
        .await;

    match result {
        Ok(value) => Ok(ok(json!({ "value": value }))),
        Err(err) => {
            // A failed launch must leave nothing authorized behind.
            kernel.caps.revoke_all(&body.app_id);
            Err(err.into())
        }
    }
}

async fn wasm_kill(
    State(kernel): State<AppState>,
    Json(body): Json<AppIdBody>,
) -> Json<Value> {
    let killed = kernel.wasm.kill(&body.app_id);
    if killed {
        kernel.caps.revoke_all(&body.app_id);
    }
    Json(json!({ "ok": true, "killed": killed }))
}

async fn wasm_list(State(kernel): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "apps": kernel.wasm.list_apps() }))
}

// ═══════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════

fn tokens_by_name(tokens: &HashMap<Capability, String>) -> Value {
    let map: serde_json::Map<String, Value> = tokens
        .iter()
        .map(|(cap, token)| (cap.to_string(), Value::String(token.clone())))
        .collect();
    Value::Object(map)
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Kernel {
    /// The container manager, or a 503 when disabled.
    fn process_manager(&self) -> Result<&helion_sandbox::ProcessManager, ApiError> {
        self.processes
            .as_ref()
            .ok_or_else(|| {
                ApiError(KernelError::ProviderUnavailable {
                    reason: Some("container engine disabled".into()),
                })
            })
    }

    /// Provider availability map for the status endpoint.
    async fn gateway_providers_status(&self) -> Value {
        // Availability is cheap (config checks / cached probes) but still
        // async because ollama actually pings its endpoint.
        serde_json::to_value(self.providers.availability().await).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use clap::Parser;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    use crate::config::Args;

    async fn test_app() -> (Router, AppState, TempDir) {
        let dir = tempdir().unwrap();
        let args = Args::parse_from([
            "helion-node",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ]);
        let kernel = Kernel::boot(args).unwrap();
        (router(Arc::clone(&kernel)), kernel, dir)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (app, _, _dir) = test_app().await;
        let (status, _) = send(&app, Method::GET, "/api/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn analyze_blocks_eval_payload() {
        let (app, _, _dir) = test_app().await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/analyze",
            Some(json!({ "code": "<script>eval(\"x\")</script>" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"]["passed"], false);
        assert!(body["code"]["critical_count"].as_u64().unwrap() >= 1);
        let rules: Vec<&str> = body["code"]["findings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["rule"].as_str().unwrap())
            .collect();
        assert!(rules.contains(&"eval-direct"));
    }

    #[tokio::test]
    async fn storage_round_trip_and_quota() {
        let (app, _, dir) = test_app().await;

        let (status, _) = send(
            &app,
            Method::PUT,
            "/api/storage/myapp/settings",
            Some(json!({ "theme": "dark" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, Method::GET, "/api/storage/myapp/settings", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"]["theme"], "dark");

        // Spec scenario: a 6 MiB value against the 5 MiB quota.
        let big = "x".repeat(6 * 1024 * 1024);
        let (status, body) = send(
            &app,
            Method::PUT,
            "/api/storage/myapp/big",
            Some(json!(big)),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "quota_exceeded");

        let (status, _) = send(&app, Method::GET, "/api/storage/myapp/big", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // The small key survived the failed write.
        let (status, _) = send(&app, Method::GET, "/api/storage/myapp/settings", None).await;
        assert_eq!(status, StatusCode::OK);

        drop(dir);
    }

    #[tokio::test]
    async fn storage_traversal_stays_in_the_apps_tree() {
        let (app, kernel, dir) = test_app().await;
        let (status, _) = send(
            &app,
            Method::PUT,
            "/api/storage/..%2F..%2F..%2Fetc/k",
            Some(json!("v")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        kernel.storage.flush_all().unwrap();
        assert!(dir.path().join("apps/_________etc/store.json").exists());
        assert!(!dir.path().join("etc").exists());
    }

    #[tokio::test]
    async fn publish_launch_flow_issues_valid_tokens() {
        let (app, kernel, _dir) = test_app().await;

        let code = "<!-- capabilities: ui:window timer:basic storage:local -->\n<!DOCTYPE html><html><body>timer</body></html>";
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/registry/publish",
            Some(json!({
                "prompt": "a pomodoro timer with break reminders",
                "title": "Pomodoro",
                "type": "iframe",
                "code": code,
                "capabilities": ["timer:basic", "storage:local", "ui:window"],
                "model": "test-model",
                "provider": "test",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {body}");
        let hash = body["hash"].as_str().unwrap().to_string();
        assert_eq!(hash, helion_kernel::content_hash(code));
        assert_eq!(body["app"]["launches"], 1);

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/api/registry/launch/{hash}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["launches"], 2);

        let tokens = body["tokens"].as_object().unwrap();
        assert_eq!(tokens.len(), 3);
        for token in tokens.values() {
            let v = kernel.caps.verify(token.as_str().unwrap());
            assert!(v.valid, "token must verify: {:?}", v.error);
        }

        // Revocation invalidates them all.
        kernel.caps.revoke_all(&hash);
        for token in tokens.values() {
            assert!(!kernel.caps.verify(token.as_str().unwrap()).valid);
        }
    }

    #[tokio::test]
    async fn publish_is_analyzer_gated() {
        let (app, _, _dir) = test_app().await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/registry/publish",
            Some(json!({
                "prompt": "bad app",
                "title": "Bad",
                "type": "iframe",
                "code": "<script>document.cookie</script>",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "analysis_blocked");
        assert!(body["findings"].as_array().is_some());
    }

    #[tokio::test]
    async fn unknown_hash_is_404() {
        let (app, _, _dir) = test_app().await;
        let (status, body) = send(&app, Method::GET, "/api/registry/0000000000000000", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn scheduler_endpoints_drive_tasks() {
        let (app, _, _dir) = test_app().await;

        let (status, body) = send(&app, Method::GET, "/api/scheduler/tasks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["tasks"].as_array().unwrap().is_empty());

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/scheduler/run",
            Some(json!({ "id": "knowledge-pruner" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {body}");

        let (status, body) = send(
            &app,
            Method::GET,
            "/api/scheduler/history/knowledge-pruner",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["history"].as_array().unwrap().len(), 1);

        let (status, _) = send(&app, Method::POST, "/api/scheduler/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&app, Method::GET, "/api/scheduler/tasks", None).await;
        assert_eq!(body["paused"], true);
        let (status, _) = send(&app, Method::POST, "/api/scheduler/resume", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn process_endpoints_503_when_engine_disabled() {
        let (app, _, _dir) = test_app().await;
        let (status, body) = send(&app, Method::GET, "/api/process/list", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "provider_unavailable");
    }

    #[tokio::test]
    async fn profile_solidify_and_back() {
        let (app, _, dir) = test_app().await;

        let (status, body) = send(&app, Method::POST, "/api/profile/solidify", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["snapshot"]["apps"].as_array().unwrap().len(), 0);
        assert!(dir.path().join("snapshot/meta.json").exists());

        let (_, body) = send(&app, Method::GET, "/api/profile", None).await;
        assert_eq!(body["profile"]["mode"], "solidified");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/profile/ephemeral",
            Some(json!({ "clear_snapshot": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!dir.path().join("snapshot").exists());
    }

    #[tokio::test]
    async fn shell_save_is_analyzer_gated() {
        let (app, _, _dir) = test_app().await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/shell/versions",
            Some(json!({ "html": "<script>eval('x')</script>" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "analysis_blocked");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/shell/versions",
            Some(json!({ "html": "<!DOCTYPE html><html><body>shell</body></html>", "origin": "seed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = body["version"]["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/shell/activate",
            Some(json!({ "id": id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, Method::GET, "/api/shell/current", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["html"].as_str().unwrap().contains("shell"));
    }

    #[tokio::test]
    async fn wasm_launch_runs_a_module() {
        let (app, _, _dir) = test_app().await;
        let bytes = wat::parse_str(
            "(module (memory 1 4) (func (export \"main\") (result i32) i32.const 7))",
        )
        .unwrap();
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/wasm/launch",
            Some(json!({
                "app_id": "seven",
                "wasm": BASE64.encode(&bytes),
                "capabilities": ["ui:window"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {body}");
        assert_eq!(body["value"], 7);

        let (_, body) = send(&app, Method::GET, "/api/wasm/list", None).await;
        assert!(body["apps"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_endpoints() {
        let (app, _, _dir) = test_app().await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/queue",
            Some(json!({ "prompt": "write a spec for the timer" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task"]["status"], "queued");

        let (_, body) = send(&app, Method::GET, "/api/queue", None).await;
        assert_eq!(body["tasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn api_hits_record_activity() {
        let (app, kernel, _dir) = test_app().await;
        let before = kernel.scheduler.aggregate_stats();
        let _ = send(&app, Method::GET, "/api/status", None).await;
        // Activity recording is observable through the defer guard; here we
        // only assert the middleware path did not break the request.
        let after = kernel.scheduler.aggregate_stats();
        assert_eq!(before.tasks, after.tasks);
    }
}
