use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::core::error::RuntimeError;

/// `RuntimeError` rendered as `{"success": false, "error", "code"}` with a
/// matching status code.
#[derive(Debug)]
pub(crate) struct ApiError(pub RuntimeError);

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RuntimeError::Validation(_) => StatusCode::BAD_REQUEST,
            RuntimeError::MissingCredentials { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            RuntimeError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RuntimeError::AgentInactive(_)
            | RuntimeError::AlreadyTerminal { .. }
            | RuntimeError::ConcurrencyViolation { .. } => StatusCode::CONFLICT,
            RuntimeError::NotFound { .. } => StatusCode::NOT_FOUND,
            RuntimeError::CredentialCorrupt(_)
            | RuntimeError::Storage(_)
            | RuntimeError::Serialization(_)
            | RuntimeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API request failed: {}", self.0);
        }

        let mut body = json!({
            "success": false,
            "error": self.0.to_string(),
            "code": self.0.code(),
        });
        let mut retry_after = None;
        match &self.0 {
            RuntimeError::MissingCredentials { providers } => {
                body["missing"] = json!(providers);
            }
            RuntimeError::RateLimitExceeded {
                retry_after_secs, ..
            } => {
                body["retry_after_secs"] = json!(retry_after_secs);
                retry_after = HeaderValue::from_str(&retry_after_secs.to_string()).ok();
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}
