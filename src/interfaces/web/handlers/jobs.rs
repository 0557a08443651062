use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::super::error::ApiError;
use super::ApiResult;
use crate::core::runtime::EnqueueRequest;

pub async fn enqueue_job_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let job = state.runtime.enqueue(payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "job_id": job.job_id,
            "status": job.status,
            "scheduled_at": job.scheduled_at,
        })),
    ))
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_jobs_endpoint(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult {
    let jobs = state.runtime.recent_jobs(query.limit).await?;
    Ok(Json(json!({ "success": true, "jobs": jobs })))
}

pub async fn job_status_endpoint(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let view = state.runtime.status(&job_id).await?;
    Ok(Json(json!({ "success": true, "job": view })))
}

#[derive(Deserialize)]
pub struct CancelQuery {
    reason: Option<String>,
}

pub async fn cancel_job_endpoint(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<CancelQuery>,
) -> ApiResult {
    let job = state
        .runtime
        .cancel(&job_id, query.reason.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "job_id": job.job_id,
        "status": job.status,
    })))
}
