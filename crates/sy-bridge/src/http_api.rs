use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use sy_broker::QueueRegistry;
use sy_core::types::{Decision, HitlRequest, TaskType, Urgency};
use sy_hitl::{DecisionSubmission, HitlService};
use sy_telemetry::metrics::{global_metrics, DECISIONS_SUBMITTED};
use sy_telemetry::middleware::metrics_middleware;
use sy_telemetry::request_id::request_id_middleware;

use crate::api_error::ApiError;
use crate::ingest::{IngestOutcome, IngestService};

// ---------------------------------------------------------------------------
// ApiState
// ---------------------------------------------------------------------------

/// Shared application state for all HTTP handlers.
pub struct ApiState {
    pub hitl: Arc<HitlService>,
    pub registry: Arc<QueueRegistry>,
    pub ingest: Arc<IngestService>,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(
        hitl: Arc<HitlService>,
        registry: Arc<QueueRegistry>,
        ingest: Arc<IngestService>,
    ) -> Self {
        Self {
            hitl,
            registry,
            ingest,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the full API router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/ingest", post(ingest_event))
        .route("/api/hitl/pending", get(list_pending))
        .route("/api/hitl/{id}/decision", post(submit_decision))
        .route("/api/hitl/metrics", get(get_hitl_metrics))
        .route("/api/metrics", get(get_metrics_prometheus))
        .route("/api/metrics/json", get(get_metrics_json))
        .layer(axum_middleware::from_fn(metrics_middleware))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    queues: Vec<QueueDepth>,
    pending_reviews: u64,
}

#[derive(Debug, Serialize)]
struct QueueDepth {
    name: String,
    depth: usize,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub urgency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub decision: String,
    pub reviewer: String,
    #[serde(default)]
    pub notes: String,
    pub modified_action: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Tenant scope comes from the `x-tenant-id` header; there is no implicit
/// global scope.
fn tenant_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing x-tenant-id header".to_string()))
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let mut queues: Vec<QueueDepth> = state
        .registry
        .depths()
        .into_iter()
        .map(|(name, depth)| QueueDepth { name, depth })
        .collect();
    queues.sort_by(|a, b| a.name.cmp(&b.name));

    let metrics = state.hitl.metrics().await?;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        queues,
        pending_reviews: metrics.pending_count,
    }))
}

async fn ingest_event(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_from_headers(&headers)?;
    let outcome = state
        .ingest
        .ingest(&tenant, req.task_type, req.payload, req.priority)
        .await
        .map_err(|e| match e {
            crate::ingest::IngestError::Broker(sy_broker::BrokerError::PriorityOutOfRange {
                ..
            }) => ApiError::BadRequest(e.to_string()),
            crate::ingest::IngestError::UnroutedTaskType(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::InternalError(other.to_string()),
        })?;

    let body = match outcome {
        IngestOutcome::Enqueued { envelope_id, queue } => serde_json::json!({
            "outcome": "enqueued",
            "envelope_id": envelope_id,
            "queue": queue,
        }),
        IngestOutcome::Escalated { request_id, urgency } => serde_json::json!({
            "outcome": "escalated",
            "request_id": request_id,
            "urgency": urgency.as_str(),
        }),
    };
    Ok((axum::http::StatusCode::ACCEPTED, Json(body)))
}

async fn list_pending(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<HitlRequest>>, ApiError> {
    let tenant = tenant_from_headers(&headers)?;
    let urgency = match query.urgency.as_deref() {
        None => None,
        Some(raw) => Some(
            Urgency::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown urgency '{raw}'")))?,
        ),
    };
    let pending = state.hitl.list_pending(&tenant, urgency).await?;
    Ok(Json(pending))
}

async fn submit_decision(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = Decision::parse(&req.decision)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown decision '{}'", req.decision)))?;
    if req.reviewer.trim().is_empty() {
        return Err(ApiError::BadRequest("reviewer must not be blank".to_string()));
    }

    let outcome = state
        .hitl
        .submit_decision(DecisionSubmission {
            request_id: id,
            decision,
            reviewer: req.reviewer,
            notes: req.notes,
            modified_action: req.modified_action,
        })
        .await?;

    global_metrics().increment_counter(DECISIONS_SUBMITTED, &[("decision", decision.as_str())]);
    let status = match outcome {
        sy_hitl::service::SubmissionOutcome::Applied => "applied",
        sy_hitl::service::SubmissionOutcome::AlreadyDecided => "already_decided",
    };
    Ok(Json(serde_json::json!({ "status": status })))
}

async fn get_hitl_metrics(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let metrics = state.hitl.metrics().await?;
    Ok(Json(metrics))
}

async fn get_metrics_prometheus() -> impl IntoResponse {
    global_metrics().export_prometheus()
}

async fn get_metrics_json() -> impl IntoResponse {
    Json(global_metrics().export_json())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
