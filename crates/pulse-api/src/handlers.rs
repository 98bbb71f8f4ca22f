//! Route handler functions for the relay endpoints.
//!
//! Bodies are taken as raw bytes and parsed here so that malformed JSON gets
//! the same `{ok:false,...}` 400 body as a missing field.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::service::{parse_event, parse_tool_call, BatchItemError, EventOutcome};
use crate::state::AppState;

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub port: u16,
    pub queued_file_read_buckets: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolResponse {
    pub ok: bool,
    pub buffered: bool,
    pub forwarded: usize,
    pub title: String,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub ok: bool,
    pub accepted: usize,
    pub buffered: usize,
    pub forwarded: usize,
    pub errors: Vec<BatchItemError>,
}

fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("request body is empty".to_string()));
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {}", e)))
}

// =============================================================================
// Handler functions
// =============================================================================

/// POST /events - simple webhook event, gated by rate limit and title dedup.
pub async fn post_events(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event = parse_event(parse_body(&body)?)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    match state.service.ingest_event(event).await? {
        EventOutcome::Forwarded { id, activity_type } => Ok(Json(json!({
            "ok": true,
            "id": id,
            "type": activity_type,
        }))
        .into_response()),
        EventOutcome::Duplicate => Ok(Json(json!({
            "ok": true,
            "deduplicated": true,
        }))
        .into_response()),
        EventOutcome::RateLimited => Err(ApiError::TooManyRequests(
            "event type seen less than the rate-limit interval ago".to_string(),
        )),
    }
}

/// POST /tools - one raw tool call.
pub async fn post_tools(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ToolResponse>), ApiError> {
    let call = parse_tool_call(parse_body(&body)?)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let outcome = state.service.ingest_tool_call(call).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ToolResponse {
            ok: true,
            buffered: outcome.buffered,
            forwarded: outcome.forwarded,
            title: outcome.title,
        }),
    ))
}

/// POST /batch - an array of raw tool calls; 207 when any item failed.
pub async fn post_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<BatchResponse>), ApiError> {
    let items = match parse_body(&body)? {
        Value::Array(items) => items,
        _ => {
            return Err(ApiError::BadRequest(
                "batch body must be a JSON array".to_string(),
            ))
        }
    };

    let report = state.service.ingest_batch(items).await;
    let ok = report.errors.is_empty();
    let status = if ok {
        StatusCode::ACCEPTED
    } else {
        StatusCode::MULTI_STATUS
    };

    Ok((
        status,
        Json(BatchResponse {
            ok,
            accepted: report.accepted,
            buffered: report.buffered,
            forwarded: report.forwarded,
            errors: report.errors,
        }),
    ))
}

/// GET /health - liveness plus batcher backlog.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        port: state.config.relay.port,
        queued_file_read_buckets: state.service.queued_buckets(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}
