#![allow(dead_code)]

use axum::http::{HeaderMap, StatusCode};
use axum::{Json, Router, extract::State, routing::post};
use base64::Engine;
use serde_json::{Value, json};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Fast-moving runtime settings so jobs settle within a test's patience.
const E2E_CONFIG: &str = r#"
[worker]
count = 1
capacity = 2
heartbeat_interval_secs = 1

[scheduler]
poll_interval_ms = 100

[retry]
base_delay_secs = 0
max_delay_secs = 0

[dispatch]
default_timeout_secs = 5

[rate_limit]
per_user_agent = 1000
"#;

pub struct DaemonHarness {
    child: Child,
    pub api_port: u16,
    pub api_base: String,
    data_dir: TempDir,
    artifact_dir: PathBuf,
    trace_log: Arc<Mutex<Vec<String>>>,
}

impl DaemonHarness {
    pub async fn spawn() -> TestResult<Self> {
        let api_port = find_free_port()?;
        let data_dir = tempfile::Builder::new()
            .prefix("hookwork-e2e-data")
            .tempdir()?;
        std::fs::write(data_dir.path().join("hookwork.toml"), E2E_CONFIG)?;
        let artifact_dir = prepare_artifact_dir(data_dir.path())?;
        let daemon_log = artifact_dir.join(format!("daemon-{}.log", api_port));

        let bin = hookwork_binary_path()?;
        let log_file = std::fs::File::create(&daemon_log)?;
        let log_file_err = log_file.try_clone()?;
        let vault_key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);

        let child = Command::new(bin)
            .arg("daemon-run")
            .arg("--api-host")
            .arg("127.0.0.1")
            .arg("--api-port")
            .arg(api_port.to_string())
            .env("HOOKWORK_DATA_DIR", data_dir.path())
            .env("HOOKWORK_VAULT_KEY", vault_key)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .spawn()?;

        let mut harness = Self {
            child,
            api_port,
            api_base: format!("http://127.0.0.1:{}", api_port),
            data_dir,
            artifact_dir,
            trace_log: Arc::new(Mutex::new(Vec::new())),
        };

        harness.wait_until_ready().await?;
        Ok(harness)
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    async fn wait_until_ready(&mut self) -> TestResult<()> {
        for _ in 0..80 {
            if let Some(status) = self.child.try_wait()? {
                return Err(format!("hookwork daemon exited early with status: {}", status).into());
            }

            let res = reqwest::Client::new()
                .get(format!("{}/api/health", self.api_base))
                .timeout(Duration::from_millis(700))
                .send()
                .await;

            if let Ok(resp) = res
                && resp.status().is_success()
            {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err("Timed out waiting for hookwork API readiness".into())
    }

    pub async fn register_agent(&self, agent_id: &str, registration: Value) -> TestResult<()> {
        let (_, out) = self
            .request(
                reqwest::Method::PUT,
                &format!("/api/agents/{}", agent_id),
                Some(registration),
            )
            .await?;
        ensure_success(&out, "register_agent")
    }

    pub async fn store_credential(&self, user: &str, provider: &str, value: &str) -> TestResult<()> {
        let (_, out) = self
            .request(
                reqwest::Method::PUT,
                &format!("/api/users/{}/credentials/{}", user, provider),
                Some(json!({ "value": value })),
            )
            .await?;
        ensure_success(&out, "store_credential")
    }

    pub async fn enqueue(&self, body: Value) -> TestResult<(StatusCode, Value)> {
        self.request(reqwest::Method::POST, "/api/jobs", Some(body))
            .await
    }

    pub async fn job_status(&self, job_id: &str) -> TestResult<Value> {
        let out = self
            .request_json(reqwest::Method::GET, &format!("/api/jobs/{}", job_id), None)
            .await?;
        out.get("job")
            .cloned()
            .ok_or_else(|| format!("job_status returned no job: {}", out).into())
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: &str, timeout: Duration) -> TestResult<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.job_status(job_id).await?;
            let status = job.get("status").and_then(Value::as_str).unwrap_or_default();
            if matches!(status, "completed" | "failed" | "timeout" | "cancelled") {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("job {} still {} after {:?}", job_id, status, timeout).into());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn persist_trace_file(&self, name: &str) -> TestResult<PathBuf> {
        let path = self.artifact_dir.join(format!("{}.trace.log", name));
        let lines = self.trace_log.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::write(&path, lines.join("\n\n---\n\n"))?;
        Ok(path)
    }

    pub async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> TestResult<Value> {
        let (_, parsed) = self.request(method, path, body).await?;
        Ok(parsed)
    }

    pub async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> TestResult<(StatusCode, Value)> {
        let url = format!("{}{}", self.api_base, path);
        let client = reqwest::Client::new();
        let mut req = client
            .request(method.clone(), &url)
            .timeout(Duration::from_secs(30));
        if let Some(payload) = body.clone() {
            req = req.json(&payload);
        }

        let resp = req.send().await?;
        let status = StatusCode::from_u16(resp.status().as_u16())?;
        let text = resp.text().await?;
        let parsed = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| {
            json!({
                "success": false,
                "raw": text,
                "error": format!("non-json response status={}", status)
            })
        });

        let mut traces = self.trace_log.lock().unwrap_or_else(|e| e.into_inner());
        traces.push(format!(
            "REQUEST {} {}\nBODY {}\nSTATUS {}\nRESPONSE {}",
            method,
            path,
            body.unwrap_or(Value::Null),
            status,
            parsed
        ));
        drop(traces);

        Ok((status, parsed))
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        let _ = self.persist_trace_file("daemon");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// One delivery as seen by the mock agent.
#[derive(Debug, Clone)]
pub struct ReceivedCall {
    pub path: &'static str,
    pub authorization: Option<String>,
    pub job_id: Option<String>,
    pub body: Value,
}

#[derive(Clone)]
struct MockAgentState {
    calls: Arc<Mutex<Vec<ReceivedCall>>>,
}

impl MockAgentState {
    fn record(&self, path: &'static str, headers: &HeaderMap, body: Value) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.push(ReceivedCall {
            path,
            authorization: header("authorization"),
            job_id: header("x-hookwork-job-id"),
            body,
        });
    }
}

pub struct MockAgentServer {
    pub port: u16,
    calls: Arc<Mutex<Vec<ReceivedCall>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

async fn mock_hook(
    State(state): State<MockAgentState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.record("/hook", &headers, body.clone());
    Json(json!({
        "echo": body,
        "authorization": headers
            .get("authorization")
            .and_then(|v| v.to_str().ok()),
    }))
}

async fn mock_broken(
    State(state): State<MockAgentState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    state.record("/broken", &headers, body);
    StatusCode::SERVICE_UNAVAILABLE
}

impl MockAgentServer {
    pub async fn start() -> TestResult<Self> {
        let port = find_free_port()?;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let state = MockAgentState {
            calls: Arc::clone(&calls),
        };
        let app = Router::new()
            .route("/hook", post(mock_hook))
            .route("/broken", post(mock_broken))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            port,
            calls,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn calls(&self) -> Vec<ReceivedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<ReceivedCall> {
        self.calls().into_iter().filter(|c| c.path == path).collect()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

pub fn find_free_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Socket binds are refused in some sandboxes; callers skip instead of failing.
pub fn bind_not_permitted(err: &(dyn std::error::Error + Send + Sync)) -> bool {
    err.to_string().contains("Operation not permitted")
}

fn hookwork_binary_path() -> TestResult<PathBuf> {
    if let Some(path) = option_env!("CARGO_BIN_EXE_hookwork") {
        return Ok(PathBuf::from(path));
    }

    let candidate = PathBuf::from("target")
        .join("debug")
        .join(if cfg!(windows) { "hookwork.exe" } else { "hookwork" });
    if candidate.exists() {
        return Ok(candidate);
    }

    Err("Could not locate hookwork test binary path".into())
}

fn prepare_artifact_dir(data_dir: &Path) -> TestResult<PathBuf> {
    let path = std::env::var("HOOKWORK_E2E_ARTIFACTS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("artifacts"));
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

fn ensure_success(value: &Value, action: &str) -> TestResult<()> {
    if value.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }
    Err(format!("{} failed: {}", action, value).into())
}
