use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::store::types::{AgentDescriptor, JobRecord};
use crate::core::vault::ResolvedCredentials;
use crate::core::vault::inject::prepare_request;
use crate::core::worker::retry::FailureKind;

pub const JOB_ID_HEADER: &str = "x-hookwork-job-id";
pub const ATTEMPT_HEADER: &str = "x-hookwork-attempt";

/// Result of one webhook attempt. Never carries credential plaintext.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        status_code: u16,
        body: serde_json::Value,
        duration_ms: u64,
        /// The response exceeded the size cap; `body` holds the redacted
        /// prefix as text.
        truncated: bool,
    },
    HttpFailure {
        status_code: u16,
        duration_ms: u64,
    },
    NetworkFailure {
        error: String,
        duration_ms: u64,
    },
    TimeoutFailure {
        duration_ms: u64,
    },
}

impl Outcome {
    pub fn duration_ms(&self) -> u64 {
        match self {
            Self::Success { duration_ms, .. }
            | Self::HttpFailure { duration_ms, .. }
            | Self::NetworkFailure { duration_ms, .. }
            | Self::TimeoutFailure { duration_ms } => *duration_ms,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::HttpFailure { .. } => Some(FailureKind::Http),
            Self::NetworkFailure { .. } => Some(FailureKind::Network),
            Self::TimeoutFailure { .. } => Some(FailureKind::Timeout),
        }
    }

    /// Human-readable error for `last_error`.
    pub fn describe(&self) -> String {
        match self {
            Self::Success { status_code, .. } => format!("HTTP {}", status_code),
            Self::HttpFailure { status_code, .. } => {
                format!("webhook returned HTTP {}", status_code)
            }
            Self::NetworkFailure { error, .. } => format!("network error: {}", error),
            Self::TimeoutFailure { duration_ms } => {
                format!("webhook did not respond within {}ms", duration_ms)
            }
        }
    }
}

/// Performs one agent invocation. Implementations never retry.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentDescriptor,
        job: &JobRecord,
        credentials: &ResolvedCredentials,
    ) -> Outcome;
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    default_timeout: Duration,
    max_response_bytes: usize,
}

impl WebhookDispatcher {
    pub fn new(default_timeout: Duration, max_response_bytes: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hookwork/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            default_timeout,
            max_response_bytes,
        })
    }

    fn timeout_for(&self, agent: &AgentDescriptor) -> Duration {
        agent
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn parse_body(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

struct LimitedBody {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Read the body up to `limit`, plus `overlap` bytes past it so a secret
/// straddling the cap is still whole when redaction runs.
async fn read_limited(
    mut response: reqwest::Response,
    limit: usize,
    overlap: usize,
) -> reqwest::Result<LimitedBody> {
    let ceiling = limit.saturating_add(overlap);
    let mut bytes = Vec::new();
    let mut truncated = false;
    while let Some(chunk) = response.chunk().await? {
        bytes.extend_from_slice(&chunk);
        if bytes.len() > limit {
            truncated = true;
            if bytes.len() >= ceiling {
                bytes.truncate(ceiling);
                break;
            }
        }
    }
    Ok(LimitedBody { bytes, truncated })
}

/// Redact first, then cut to `limit` on a char boundary.
fn response_body(
    body: &LimitedBody,
    limit: usize,
    credentials: &ResolvedCredentials,
) -> serde_json::Value {
    if !body.truncated {
        return credentials.redact_value(parse_body(&body.bytes));
    }
    let mut text = credentials.redact(&String::from_utf8_lossy(&body.bytes));
    let mut end = limit.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    serde_json::Value::String(text)
}

#[async_trait]
impl Invoker for WebhookDispatcher {
    async fn invoke(
        &self,
        agent: &AgentDescriptor,
        job: &JobRecord,
        credentials: &ResolvedCredentials,
    ) -> Outcome {
        let timeout = self.timeout_for(agent);
        let prepared = prepare_request(&job.payload, credentials);

        let mut request = self
            .client
            .post(&agent.webhook_url)
            .header(JOB_ID_HEADER, job.job_id.as_str())
            .header(ATTEMPT_HEADER, (job.retry_count + 1).to_string())
            .json(&prepared.body);
        for (name, value) in &prepared.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !prepared.query.is_empty() {
            request = request.query(&prepared.query);
        }
        drop(prepared);

        let max_bytes = self.max_response_bytes;
        let overlap = credentials.longest_needle();
        let started = Instant::now();
        let call = async move {
            let response = request.send().await?;
            let status = response.status();
            let body = read_limited(response, max_bytes, overlap).await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let outcome = match tokio::time::timeout(timeout, call).await {
            Err(_) => Outcome::TimeoutFailure {
                duration_ms: elapsed_ms(started).max(timeout.as_millis() as u64),
            },
            Ok(Err(e)) => Outcome::NetworkFailure {
                error: credentials.redact(&e.without_url().to_string()),
                duration_ms: elapsed_ms(started),
            },
            Ok(Ok((status, body))) if status.is_success() => {
                if body.truncated {
                    warn!(
                        job_id = %job.job_id,
                        agent_id = %agent.agent_id,
                        limit = max_bytes,
                        "Webhook response exceeded size cap; keeping truncated text"
                    );
                }
                Outcome::Success {
                    status_code: status.as_u16(),
                    body: response_body(&body, max_bytes, credentials),
                    duration_ms: elapsed_ms(started),
                    truncated: body.truncated,
                }
            }
            Ok(Ok((status, _))) => Outcome::HttpFailure {
                status_code: status.as_u16(),
                duration_ms: elapsed_ms(started),
            },
        };
        debug!(
            job_id = %job.job_id,
            agent_id = %agent.agent_id,
            duration_ms = outcome.duration_ms(),
            "Webhook attempt finished"
        );
        outcome
    }
}

#[cfg(test)]
pub mod test_server {
    //! Local stand-in for agent webhooks.

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    pub struct Hits(pub Arc<AtomicUsize>);

    impl Hits {
        pub fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    pub struct MockWebhook {
        pub base_url: String,
        pub hits: Hits,
        shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    }

    impl MockWebhook {
        pub fn url(&self, path: &str) -> String {
            format!("{}{}", self.base_url, path)
        }
    }

    impl Drop for MockWebhook {
        fn drop(&mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
        }
    }

    async fn echo(
        State(hits): State<Hits>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        hits.0.fetch_add(1, Ordering::SeqCst);
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Json(json!({
            "body": body,
            "authorization": header("authorization"),
            "job_id": header("x-hookwork-job-id"),
            "attempt": header("x-hookwork-attempt"),
            "query": query,
        }))
    }

    async fn fail(State(hits): State<Hits>) -> StatusCode {
        hits.0.fetch_add(1, Ordering::SeqCst);
        StatusCode::SERVICE_UNAVAILABLE
    }

    /// Plain-text body that puts the caller's Authorization header at byte 60.
    async fn big(State(hits): State<Hits>, headers: HeaderMap) -> String {
        hits.0.fetch_add(1, Ordering::SeqCst);
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        format!("{}{}{}", "a".repeat(60), auth, "b".repeat(200))
    }

    async fn slow(State(hits): State<Hits>) -> Json<Value> {
        hits.0.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        Json(json!({ "late": true }))
    }

    pub async fn start() -> MockWebhook {
        let hits = Hits::default();
        let app = Router::new()
            .route("/ok", post(echo))
            .route("/fail", post(fail))
            .route("/slow", post(slow))
            .route("/big", post(big))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });
        MockWebhook {
            base_url: format!("http://{}", addr),
            hits,
            shutdown: Some(tx),
        }
    }
}
