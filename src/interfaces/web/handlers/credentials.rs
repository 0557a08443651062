use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::ApiResult;

#[derive(Deserialize)]
pub struct PutCredentialRequest {
    value: String,
}

pub async fn list_credentials(Path(user): Path<String>, State(state): State<AppState>) -> ApiResult {
    let credentials = state.runtime.list_credentials(&user).await?;
    Ok(Json(json!({ "success": true, "credentials": credentials })))
}

pub async fn put_credential(
    Path((user, provider)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(payload): Json<PutCredentialRequest>,
) -> ApiResult {
    state
        .runtime
        .store_credential(&user, &provider, &payload.value)
        .await?;
    Ok(Json(json!({ "success": true, "provider": provider, "status": "active" })))
}

pub async fn delete_credential(
    Path((user, provider)): Path<(String, String)>,
    State(state): State<AppState>,
) -> ApiResult {
    state.runtime.remove_credential(&user, &provider).await?;
    Ok(Json(json!({ "success": true, "message": "Credential removed" })))
}
