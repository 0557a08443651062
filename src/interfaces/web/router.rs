use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post, put},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{agents, credentials, jobs, schedules, system};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(system::health_endpoint))
        .route("/api/workers", get(system::get_workers_endpoint))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .route(
            "/api/jobs",
            get(jobs::list_jobs_endpoint).post(jobs::enqueue_job_endpoint),
        )
        .route("/api/jobs/{job_id}", get(jobs::job_status_endpoint))
        .route("/api/jobs/{job_id}/cancel", post(jobs::cancel_job_endpoint))
        .route(
            "/api/schedules",
            get(schedules::get_schedules_endpoint).post(schedules::upsert_schedule_endpoint),
        )
        .route(
            "/api/schedules/{schedule_id}",
            axum::routing::delete(schedules::delete_schedule_endpoint),
        )
        .route("/api/agents", get(agents::get_agents))
        .route(
            "/api/agents/{agent}",
            get(agents::get_agent).put(agents::put_agent),
        )
        .route(
            "/api/users/{user}/credentials",
            get(credentials::list_credentials),
        )
        .route(
            "/api/users/{user}/credentials/{provider}",
            put(credentials::put_credential).delete(credentials::delete_credential),
        )
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RuntimeConfig;
    use crate::core::runtime::Runtime;
    use crate::core::runtime::rate_limit::RateLimiter;
    use crate::core::store::test_store;
    use crate::core::vault::test_vault;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn state_with(limiter: RateLimiter) -> AppState {
        let store = test_store();
        let vault = Arc::new(test_vault(store.clone()));
        let runtime = Runtime::new(store, vault, &RuntimeConfig::default()).with_rate_limiter(limiter);
        let (log_tx, _) = tokio::sync::broadcast::channel(16);
        AppState {
            runtime: Arc::new(runtime),
            log_tx,
            api_port: 17990,
        }
    }

    fn test_state() -> AppState {
        state_with(RateLimiter::unlimited())
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, headers, json)
    }

    async fn register_agent(state: &AppState, agent: &str, providers: &[&str]) {
        let required: Vec<serde_json::Value> = providers
            .iter()
            .map(|p| json!({ "provider": p, "format_template": "Bearer {{value}}" }))
            .collect();
        let (status, _, json) = json_request(
            build_api_router(state.clone()),
            Method::PUT,
            &format!("/api/agents/{}", agent),
            Some(json!({
                "webhook_url": "https://agent.test/hook",
                "required_credentials": required,
                "timeout_secs": 15
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{json}");
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = build_api_router(test_state());
        let (status, headers, json) = json_request(app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn enqueue_then_status_then_cancel() {
        let state = test_state();
        register_agent(&state, "summarizer", &[]).await;

        let (status, _, json) = json_request(
            build_api_router(state.clone()),
            Method::POST,
            "/api/jobs",
            Some(json!({
                "agent_id": "summarizer",
                "user_id": "user-1",
                "payload": { "text": "hello" },
                "priority": 5
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = json["job_id"].as_str().unwrap().to_string();

        let (status, _, json) = json_request(
            build_api_router(state.clone()),
            Method::GET,
            &format!("/api/jobs/{}", job_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["job"]["status"], "pending");
        assert_eq!(json["job"]["phases"][0]["phase"], "queued");

        let (status, _, json) = json_request(
            build_api_router(state.clone()),
            Method::POST,
            &format!("/api/jobs/{}/cancel?reason=changed%20my%20mind", job_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "cancelled");

        let (status, _, json) = json_request(
            build_api_router(state),
            Method::POST,
            &format!("/api/jobs/{}/cancel", job_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "already_terminal");
    }

    #[tokio::test]
    async fn missing_credentials_are_enumerated() {
        let state = test_state();
        register_agent(&state, "gh-bot", &["github", "openai"]).await;

        let (status, _, _) = json_request(
            build_api_router(state.clone()),
            Method::PUT,
            "/api/users/user-1/credentials/openai",
            Some(json!({ "value": "sk-live" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, json) = json_request(
            build_api_router(state),
            Method::POST,
            "/api/jobs",
            Some(json!({ "agent_id": "gh-bot", "user_id": "user-1", "payload": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["success"], false);
        assert_eq!(json["missing"], json!(["github"]));
    }

    #[tokio::test]
    async fn rate_limited_enqueue_returns_retry_after() {
        let state = state_with(RateLimiter::new(Duration::from_secs(60), Some(1), None));
        register_agent(&state, "a", &[]).await;
        let body = json!({ "agent_id": "a", "user_id": "u", "payload": {} });

        let (status, _, _) =
            json_request(build_api_router(state.clone()), Method::POST, "/api/jobs", Some(body.clone()))
                .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, headers, json) =
            json_request(build_api_router(state), Method::POST, "/api/jobs", Some(body)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(headers.get("retry-after").is_some());
        assert_eq!(json["code"], "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn credential_listing_hides_values() {
        let state = test_state();
        json_request(
            build_api_router(state.clone()),
            Method::PUT,
            "/api/users/user-1/credentials/github",
            Some(json!({ "value": "ghp_topsecret" })),
        )
        .await;
        let (status, _, json) = json_request(
            build_api_router(state.clone()),
            Method::GET,
            "/api/users/user-1/credentials",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["credentials"][0]["provider"], "github");
        assert!(!json.to_string().contains("ghp_topsecret"));

        let (status, _, _) = json_request(
            build_api_router(state.clone()),
            Method::DELETE,
            "/api/users/user-1/credentials/github",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = json_request(
            build_api_router(state),
            Method::DELETE,
            "/api/users/user-1/credentials/github",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schedules_roundtrip() {
        let state = test_state();
        register_agent(&state, "reporter", &[]).await;

        let (status, _, json) = json_request(
            build_api_router(state.clone()),
            Method::POST,
            "/api/schedules",
            Some(json!({
                "agent_id": "reporter",
                "user_id": "user-1",
                "cron_expression": "0 9 * * 1-5",
                "timezone": "Europe/London",
                "payload": { "report": "daily" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{json}");
        let schedule_id = json["schedule"]["schedule_id"].as_str().unwrap().to_string();
        assert!(json["schedule"]["next_run"].is_string());

        let (_, _, json) =
            json_request(build_api_router(state.clone()), Method::GET, "/api/schedules", None).await;
        assert_eq!(json["schedules"].as_array().unwrap().len(), 1);

        let (status, _, _) = json_request(
            build_api_router(state.clone()),
            Method::DELETE,
            &format!("/api/schedules/{}", schedule_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, json) = json_request(
            build_api_router(state),
            Method::POST,
            "/api/schedules",
            Some(json!({
                "agent_id": "reporter",
                "user_id": "user-1",
                "cron_expression": "not cron"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "validation_error");
    }

    #[tokio::test]
    async fn invalid_agent_registration_is_rejected() {
        let (status, _, json) = json_request(
            build_api_router(test_state()),
            Method::PUT,
            "/api/agents/bad",
            Some(json!({ "webhook_url": "file:///etc/passwd" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found_and_workers_list_is_empty() {
        let state = test_state();
        let (status, _, _) =
            json_request(build_api_router(state.clone()), Method::GET, "/api/jobs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, json) =
            json_request(build_api_router(state), Method::GET, "/api/workers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["workers"], json!([]));
    }
}
