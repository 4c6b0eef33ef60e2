//! The service's HTTP surface: an axum `Router` over shared state, grounded
//! on `PostHog-hog-rs/hook-api/src/handlers/app.rs`'s composition pattern
//! (`Router::new().route(path, routing::verb(handler)).with_state(state)`).
//!
//! A minimal bearer-token check (§6) resolves `Authorization: Bearer <key>`
//! to an `api_key_id` before every route except `/health` and `/metrics`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::cleanup::CleanupScheduler;
use crate::config::Config;
use crate::error::{CircuitBreakerTable, CoreError};
use crate::executor::compute_fingerprint;
use crate::metrics::PrometheusExporter;
use crate::models::{validate_timeout, Job, JobStatus, Priority, ScriptRequest, ScriptResponse};
use crate::queue::PriorityQueue;
use crate::store::JobStore;
use crate::validator::Validator;
use crate::video::VideoStore;
use crate::webhook::WebhookDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JobStore>,
    pub queue: Arc<PriorityQueue>,
    pub videos: Arc<VideoStore>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub validator: Arc<Validator>,
    pub breakers: CircuitBreakerTable,
    pub config: Arc<Config>,
    pub metrics: Arc<PrometheusExporter>,
    pub cleanup: Arc<CleanupScheduler>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/validate", post(validate))
        .route("/queue/status", get(queue_status))
        .route("/video/:request_id/:token", get(stream_video))
        .route("/video/:request_id/info", get(video_info))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/admin/videos/cleanup", delete(force_cleanup))
        .with_state(state)
}

async fn authenticate(state: &AppState, bearer: Option<&str>) -> Result<crate::models::ApiKey, CoreError> {
    let token = bearer.ok_or(CoreError::Unauthorized)?;
    let key = state
        .store
        .find_api_key(token)
        .await?
        .ok_or(CoreError::Unauthorized)?;
    state.store.touch_api_key(key.id).await?;
    Ok(key)
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn execute(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ScriptRequest>,
) -> Result<Json<ScriptResponse>, CoreError> {
    let api_key = authenticate(&state, bearer_token(&headers)).await?;

    let script = resolve_script(&state, &request).await?;
    let priority = Priority::validate(request.priority).map_err(|e| CoreError::Validation(vec![e]))?;
    let timeout = validate_timeout(request.timeout).map_err(|e| CoreError::Validation(vec![e]))?;

    let validation = state.validator.validate(&script);
    if !validation.is_valid {
        return Err(CoreError::Validation(validation.errors));
    }

    let fingerprint = compute_fingerprint(&script);
    if !state.breakers.can_execute(&fingerprint) {
        return Err(CoreError::ScriptTemporarilyBlocked);
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let job = Job {
        request_id: request_id.clone(),
        api_key_id: api_key.id,
        script: script.clone(),
        script_hash: fingerprint,
        script_size: script.len() as i64,
        priority: request.priority,
        timeout,
        webhook_url: request.webhook_url.clone(),
        tags: request.tags.clone(),
        user_agent: request.user_agent.clone(),
        status: JobStatus::Queued,
        created_at: chrono::Utc::now(),
        completed_at: None,
        execution_time: None,
        queue_wait_time: None,
        video_path: None,
        video_size_mb: None,
        memory_peak_mb: None,
        cpu_time_ms: None,
        result: None,
        error_message: None,
        webhook_status: None,
    };

    state.store.insert_job(&job).await?;
    state.queue.push(request_id.clone(), priority).await?;

    let position = state.queue.len().await;
    Ok(Json(ScriptResponse {
        request_id,
        status: JobStatus::Queued,
        queue_position: position,
        estimated_wait: position as f64 * 5.0,
    }))
}

async fn resolve_script(state: &AppState, request: &ScriptRequest) -> Result<String, CoreError> {
    if let Some(script) = &request.script {
        return Ok(script.clone());
    }
    if let Some(template_id) = request.template_id {
        return state
            .store
            .get_template(template_id)
            .await?
            .ok_or(CoreError::NotFound);
    }
    Err(CoreError::Validation(vec![
        "one of `script` or `template_id` is required".to_string(),
    ]))
}

async fn validate(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ScriptRequest>,
) -> Result<Json<crate::models::ValidationResult>, CoreError> {
    authenticate(&state, bearer_token(&headers)).await?;
    let script = resolve_script(&state, &request).await?;
    Ok(Json(state.validator.validate(&script)))
}

async fn queue_status(State(state): State<AppState>, headers: axum::http::HeaderMap) -> Result<Json<serde_json::Value>, CoreError> {
    authenticate(&state, bearer_token(&headers)).await?;
    let (queued, running) = state.store.queue_counts().await?;
    let top = state.queue.snapshot(10).await;
    let items: Vec<serde_json::Value> = top
        .into_iter()
        .map(|item| json!({ "request_id": item.request_id, "priority": item.priority.0 }))
        .collect();
    Ok(Json(json!({
        "queued": queued,
        "running": running,
        "capacity": state.queue.capacity(),
        "top": items,
    })))
}

async fn stream_video(
    State(state): State<AppState>,
    Path((request_id, token)): Path<(String, String)>,
) -> Result<Response, CoreError> {
    let api_key = state
        .store
        .find_api_key(&token)
        .await?
        .ok_or(CoreError::Unauthorized)?;

    let job = state.store.get_job(&request_id).await?.ok_or(CoreError::NotFound)?;
    if job.api_key_id != api_key.id && !api_key.is_admin() {
        return Err(CoreError::Forbidden);
    }

    let path = state.videos.serve_video_file(&request_id).await.ok_or(CoreError::NotFound)?;
    let bytes = tokio::fs::read(&path).await.map_err(CoreError::Io)?;
    Ok((
        [(header::CONTENT_TYPE, "video/webm")],
        bytes,
    )
        .into_response())
}

async fn video_info(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<crate::models::VideoInfo>, CoreError> {
    let api_key = authenticate(&state, bearer_token(&headers)).await?;
    let job = state.store.get_job(&request_id).await?.ok_or(CoreError::NotFound)?;
    if job.api_key_id != api_key.id && !api_key.is_admin() {
        return Err(CoreError::Forbidden);
    }
    state
        .videos
        .get_cached_info(&request_id)
        .map(Json)
        .ok_or(CoreError::NotFound)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (queued, running) = state.store.queue_counts().await.unwrap_or((0, 0));
    let trend = state.store.latest_daily_stat().await.ok().flatten();
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "queue": { "queued": queued, "running": running, "capacity": state.queue.capacity() },
        "circuit_breakers_open": state.breakers.open_count(),
        "webhook_backlog": state.webhooks.pending_count().await,
        "daily_trend": trend,
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render())
}

async fn force_cleanup(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, CoreError> {
    let api_key = authenticate(&state, bearer_token(&headers)).await?;
    let admin_configured = state.config.admin_api_key.is_some();
    if !admin_configured || !api_key.is_admin() {
        return Err(CoreError::Forbidden);
    }
    let report = state.cleanup.run_once().await;
    Ok(Json(json!({
        "videos_deleted": report.videos_deleted,
        "video_bytes_freed_mb": report.video_bytes_freed_mb,
        "executions_deleted": report.executions_deleted,
        "circuit_breakers_reaped": report.circuit_breakers_reaped,
    })))
}
