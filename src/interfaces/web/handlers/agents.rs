use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::json;

use super::super::AppState;
use super::ApiResult;
use crate::core::runtime::AgentRegistration;

pub async fn get_agents(State(state): State<AppState>) -> ApiResult {
    let agents = state.runtime.list_agents().await?;
    Ok(Json(json!({ "success": true, "agents": agents })))
}

pub async fn get_agent(Path(agent): Path<String>, State(state): State<AppState>) -> ApiResult {
    let descriptor = state.runtime.get_agent(&agent).await?;
    Ok(Json(json!({ "success": true, "agent": descriptor })))
}

pub async fn put_agent(
    Path(agent): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<AgentRegistration>,
) -> ApiResult {
    let descriptor = state.runtime.register_agent(&agent, payload).await?;
    Ok(Json(json!({ "success": true, "agent": descriptor })))
}
