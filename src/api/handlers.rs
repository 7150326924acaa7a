//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    CancelResponse, ChatRequest, ErrorResponse, RecordListResponse, RecordResponse, ResetResponse,
};
use super::AppState;
use crate::error::OrchestratorError;
use crate::runtime::{SubmitAck, UsageSummary};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Header carrying the authenticated caller, set by the fronting auth layer
const CALLER_HEADER: &str = "x-caller-id";

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(send_chat))
        .route("/api/chat/cancel", post(cancel_chat))
        .route("/api/thread/reset", post(reset_thread))
        .route("/api/messages", get(list_messages))
        .route("/api/messages/:id", get(get_message))
        .route("/api/usage", get(get_usage))
        .route("/api/stream", get(stream_events))
        .route("/version", get(get_version))
        .with_state(state)
}

fn caller_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("Missing {CALLER_HEADER} header")))
}

// ============================================================
// Chat
// ============================================================

async fn send_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<(StatusCode, Json<SubmitAck>), AppError> {
    let caller_id = caller_id(&headers)?;
    if req.message.trim().is_empty() {
        return Err(AppError::BadRequest("Message must not be empty".to_string()));
    }

    let ack = state
        .orchestrator
        .submit(&caller_id, &req.message, req.tone)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn cancel_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CancelResponse>, AppError> {
    let caller_id = caller_id(&headers)?;
    let cancelled = state.orchestrator.cancel(&caller_id);
    Ok(Json(CancelResponse { cancelled }))
}

async fn reset_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetResponse>, AppError> {
    let caller_id = caller_id(&headers)?;
    let thread = state.orchestrator.reset(&caller_id).await?;
    Ok(Json(ResetResponse {
        conversation_id: thread.0,
    }))
}

// ============================================================
// Records
// ============================================================

async fn get_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RecordResponse>, AppError> {
    let caller_id = caller_id(&headers)?;
    let record = state.orchestrator.get_record(&caller_id, &id).await?;
    let limit_remaining = state.orchestrator.limit_remaining(&caller_id).await?;
    Ok(Json(RecordResponse {
        record,
        limit_remaining,
    }))
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RecordListResponse>, AppError> {
    let caller_id = caller_id(&headers)?;
    let records = state.orchestrator.list_records(&caller_id).await?;
    let limit_remaining = state.orchestrator.limit_remaining(&caller_id).await?;
    Ok(Json(RecordListResponse {
        records,
        limit_remaining,
    }))
}

async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UsageSummary>, AppError> {
    let caller_id = caller_id(&headers)?;
    Ok(Json(state.orchestrator.usage(&caller_id).await?))
}

// ============================================================
// Streaming
// ============================================================

async fn stream_events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let caller_id = caller_id(&headers)?;
    // Subscribe before reading the budget so nothing published in between is missed
    let rx = state.orchestrator.subscribe();
    let limit_remaining = state.orchestrator.limit_remaining(&caller_id).await?;
    let watching = state.orchestrator.watch(&caller_id);
    Ok(sse_stream(caller_id, limit_remaining, rx, watching))
}

async fn get_version() -> &'static str {
    concat!("assistant-orchestrator ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Orchestrator(OrchestratorError),
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        AppError::Orchestrator(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let e = match self {
            AppError::BadRequest(msg) => {
                return (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(msg))).into_response();
            }
            AppError::Orchestrator(e) => e,
        };

        let status = match &e {
            OrchestratorError::RateLimited { .. } | OrchestratorError::BudgetExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            OrchestratorError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::UpstreamRunFailed(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::RecordFinalized(_) => StatusCode::CONFLICT,
            OrchestratorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %e, status = %status, "Request failed");
        }

        let mut body = ErrorResponse::new(e.to_string());
        let retry_after = match &e {
            OrchestratorError::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };
        body.retry_after_secs = retry_after;

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
