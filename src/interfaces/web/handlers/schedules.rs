use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::json;

use super::super::AppState;
use super::ApiResult;
use crate::core::runtime::ScheduleRequest;

pub async fn get_schedules_endpoint(State(state): State<AppState>) -> ApiResult {
    let schedules = state.runtime.list_schedules().await?;
    Ok(Json(json!({ "success": true, "schedules": schedules })))
}

pub async fn upsert_schedule_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<ScheduleRequest>,
) -> ApiResult {
    let schedule = state.runtime.upsert_schedule(payload).await?;
    Ok(Json(json!({ "success": true, "schedule": schedule })))
}

pub async fn delete_schedule_endpoint(
    Path(schedule_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    state.runtime.delete_schedule(&schedule_id).await?;
    Ok(Json(json!({ "success": true, "message": "Schedule removed" })))
}
