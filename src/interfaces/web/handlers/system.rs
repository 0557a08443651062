use axum::{Json, extract::State};
use serde_json::json;

use super::super::AppState;
use super::ApiResult;

pub async fn health_endpoint() -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn get_workers_endpoint(State(state): State<AppState>) -> ApiResult {
    let workers = state.runtime.workers().await?;
    Ok(Json(json!({ "success": true, "workers": workers })))
}
