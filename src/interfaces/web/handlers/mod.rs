pub(super) mod agents;
pub(super) mod credentials;
pub(super) mod jobs;
pub(super) mod schedules;
pub(super) mod system;

pub(super) type ApiResult = Result<axum::Json<serde_json::Value>, super::error::ApiError>;
