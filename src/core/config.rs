use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{Level, info};

pub const CONFIG_FILE_NAME: &str = "hookwork.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub feedback: FeedbackConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Maximum in-flight jobs per worker.
    #[serde(default = "default_worker_capacity")]
    pub capacity: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// A running job whose worker has been silent this long is reclaimed.
    #[serde(default = "default_heartbeat_grace_secs")]
    pub heartbeat_grace_secs: u64,
    /// Providers this pool can serve. Unset means every provider.
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
    /// Jobs a single user may enqueue against one agent inside the window.
    #[serde(default = "default_per_user_agent")]
    pub per_user_agent: Option<u32>,
    /// Jobs a single user may enqueue across all agents inside the window.
    #[serde(default)]
    pub per_user: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_feedback_window")]
    pub window: usize,
    #[serde(default = "default_feedback_threshold")]
    pub threshold: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VaultConfig {
    /// Required secret prefix per provider, e.g. `openai = "sk-"`.
    #[serde(default)]
    pub provider_prefixes: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    17990
}
fn default_worker_count() -> usize {
    2
}
fn default_worker_capacity() -> usize {
    4
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_heartbeat_grace_secs() -> u64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_retry_base_secs() -> u64 {
    60
}
fn default_retry_max_secs() -> u64 {
    30 * 60
}
fn default_max_retries() -> u32 {
    3
}
fn default_dispatch_timeout_secs() -> u64 {
    30
}
fn default_max_response_bytes() -> usize {
    1024 * 1024
}
fn default_rate_window_secs() -> u64 {
    60
}
fn default_per_user_agent() -> Option<u32> {
    Some(60)
}
fn default_feedback_window() -> usize {
    5
}
fn default_feedback_threshold() -> usize {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            capacity: default_worker_capacity(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            heartbeat_grace_secs: default_heartbeat_grace_secs(),
            capabilities: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_retry_base_secs(),
            max_delay_secs: default_retry_max_secs(),
            default_max_retries: default_max_retries(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_dispatch_timeout_secs(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window_secs(),
            per_user_agent: default_per_user_agent(),
            per_user: None,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            window: default_feedback_window(),
            threshold: default_feedback_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RuntimeConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE_NAME);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config = Self::parse(&content)?;
        info!(
            "Loaded config: workers={}x{}, poll={}ms, retry base={}s cap={}s",
            config.worker.count,
            config.worker.capacity,
            config.scheduler.poll_interval_ms,
            config.retry.base_delay_secs,
            config.retry.max_delay_secs
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: RuntimeConfig = toml::from_str(content)?;
        // Zero would let a worker claim nothing forever.
        config.worker.capacity = config.worker.capacity.max(1);
        config.worker.count = config.worker.count.max(1);
        config.feedback.threshold = config.feedback.threshold.max(1);
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.poll_interval_ms.max(10))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.worker.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.worker.heartbeat_grace_secs)
    }

    pub fn default_dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.default_timeout_secs.max(1))
    }

    pub fn log_level(&self) -> Level {
        self.logging.level.parse().unwrap_or(Level::INFO)
    }
}
