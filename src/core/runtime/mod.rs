//! Caller-facing operations. The HTTP handlers are thin adapters over this.

pub mod rate_limit;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::config::RuntimeConfig;
use crate::core::error::{RuntimeError, RuntimeResult};
use crate::core::scheduler::cron;
use crate::core::store::types::{
    AgentDescriptor, CredentialSummary, JobRecord, JobStatus, LedgerEntry, NewJob,
    RequiredCredential, ScheduleRecord, WorkerRecord,
};
use crate::core::store::{MAX_RETRIES_LIMIT, Store};
use crate::core::vault::CredentialVault;
use crate::core::vault::inject::validate_template;
use rate_limit::RateLimiter;

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub agent_id: String,
    pub user_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentRegistration {
    pub webhook_url: String,
    #[serde(default)]
    pub required_credentials: Vec<RequiredCredential>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    /// Present to update an existing schedule.
    #[serde(default)]
    pub schedule_id: Option<String>,
    pub agent_id: String,
    pub user_id: String,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_active() -> bool {
    true
}

/// What the status API reports for one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub agent_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub phases: Vec<LedgerEntry>,
}

impl JobStatusView {
    fn new(job: JobRecord, phases: Vec<LedgerEntry>) -> Self {
        let output = match job.status {
            JobStatus::Completed => job.output,
            _ => None,
        };
        let error = match job.status {
            JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled => job.last_error,
            _ => None,
        };
        Self {
            job_id: job.job_id,
            agent_id: job.agent_id,
            status: job.status,
            output,
            error,
            duration_ms: job.duration_ms,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            scheduled_at: job.scheduled_at,
            created_at: job.created_at,
            completed_at: job.completed_at,
            phases,
        }
    }
}

pub struct Runtime {
    store: Store,
    vault: Arc<CredentialVault>,
    limiter: RateLimiter,
    default_max_retries: u32,
}

impl Runtime {
    pub fn new(store: Store, vault: Arc<CredentialVault>, config: &RuntimeConfig) -> Self {
        Self {
            store,
            vault,
            limiter: RateLimiter::from_config(config),
            default_max_retries: config.retry.default_max_retries,
        }
    }

    #[cfg(test)]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // -- agents -----------------------------------------------------------

    pub async fn register_agent(
        &self,
        agent_id: &str,
        registration: AgentRegistration,
    ) -> RuntimeResult<AgentDescriptor> {
        if agent_id.trim().is_empty() {
            return Err(RuntimeError::Validation("agent_id must not be empty".into()));
        }
        validate_webhook_url(&registration.webhook_url)?;
        if registration.timeout_secs == Some(0) {
            return Err(RuntimeError::Validation("timeout_secs must be positive".into()));
        }
        for requirement in &registration.required_credentials {
            if requirement.provider.trim().is_empty() {
                return Err(RuntimeError::Validation(
                    "credential provider must not be empty".into(),
                ));
            }
            validate_template(&requirement.format_template).map_err(RuntimeError::Validation)?;
        }

        self.store
            .upsert_agent(&AgentDescriptor {
                agent_id: agent_id.to_string(),
                webhook_url: registration.webhook_url,
                required_credentials: registration.required_credentials,
                timeout_secs: registration.timeout_secs,
                active: true,
                deactivated_reason: None,
                updated_at: Utc::now(),
            })
            .await
    }

    pub async fn list_agents(&self) -> RuntimeResult<Vec<AgentDescriptor>> {
        self.store.list_agents().await
    }

    pub async fn get_agent(&self, agent_id: &str) -> RuntimeResult<AgentDescriptor> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| RuntimeError::not_found("agent", agent_id))
    }

    // -- credentials ------------------------------------------------------

    pub async fn store_credential(
        &self,
        user_id: &str,
        provider: &str,
        plaintext: &str,
    ) -> RuntimeResult<()> {
        self.vault.store_credential(user_id, provider, plaintext).await
    }

    pub async fn remove_credential(&self, user_id: &str, provider: &str) -> RuntimeResult<()> {
        if self.store.remove_credential(user_id, provider).await? {
            Ok(())
        } else {
            Err(RuntimeError::not_found("credential", format!("{}/{}", user_id, provider)))
        }
    }

    pub async fn list_credentials(&self, user_id: &str) -> RuntimeResult<Vec<CredentialSummary>> {
        self.store.list_credentials(user_id).await
    }

    // -- jobs -------------------------------------------------------------

    /// Validate and persist a job. Rejections happen here, synchronously;
    /// nothing is enqueued when any check fails.
    pub async fn enqueue(&self, request: EnqueueRequest) -> RuntimeResult<JobRecord> {
        let max_retries = request
            .max_retries
            .unwrap_or(i64::from(self.default_max_retries));
        let new_job = NewJob {
            agent_id: request.agent_id,
            user_id: request.user_id,
            payload: request.payload,
            priority: request.priority.unwrap_or(0),
            scheduled_at: request.scheduled_at,
            max_retries,
            schedule_id: None,
        };
        if new_job.agent_id.trim().is_empty() || new_job.user_id.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "agent_id and user_id are required".into(),
            ));
        }
        if !(0..=MAX_RETRIES_LIMIT).contains(&new_job.max_retries) {
            return Err(RuntimeError::Validation(format!(
                "max_retries must be between 0 and {}",
                MAX_RETRIES_LIMIT
            )));
        }

        let agent = self.get_agent(&new_job.agent_id).await?;
        if !agent.active {
            return Err(RuntimeError::AgentInactive(agent.agent_id));
        }

        let missing = self
            .vault
            .missing_providers(&new_job.user_id, &agent.required_credentials)
            .await?;
        if !missing.is_empty() {
            return Err(RuntimeError::MissingCredentials { providers: missing });
        }

        self.limiter
            .check(&self.store, &new_job.user_id, &new_job.agent_id, Utc::now())
            .await?;

        self.store.enqueue_job(new_job).await
    }

    pub async fn status(&self, job_id: &str) -> RuntimeResult<JobStatusView> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| RuntimeError::not_found("job", job_id))?;
        let phases = self.store.list_phases(job_id).await?;
        Ok(JobStatusView::new(job, phases))
    }

    pub async fn cancel(&self, job_id: &str, reason: Option<&str>) -> RuntimeResult<JobRecord> {
        self.store
            .cancel_job(job_id, reason.unwrap_or("cancelled by caller"))
            .await
    }

    pub async fn recent_jobs(&self, limit: usize) -> RuntimeResult<Vec<JobRecord>> {
        self.store.list_jobs(limit.clamp(1, 500)).await
    }

    pub async fn workers(&self) -> RuntimeResult<Vec<WorkerRecord>> {
        self.store.list_workers().await
    }

    // -- schedules --------------------------------------------------------

    pub async fn upsert_schedule(&self, request: ScheduleRequest) -> RuntimeResult<ScheduleRecord> {
        if request.agent_id.trim().is_empty() || request.user_id.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "agent_id and user_id are required".into(),
            ));
        }
        let max_retries = request.max_retries.unwrap_or(self.default_max_retries);
        if i64::from(max_retries) > MAX_RETRIES_LIMIT {
            return Err(RuntimeError::Validation(format!(
                "max_retries must be between 0 and {}",
                MAX_RETRIES_LIMIT
            )));
        }
        self.get_agent(&request.agent_id).await?;

        let now = Utc::now();
        let next_run = cron::next_run_after(&request.cron_expression, &request.timezone, now)?;
        let existing = match request.schedule_id.as_deref() {
            Some(id) => Some(
                self.store
                    .get_schedule(id)
                    .await?
                    .ok_or_else(|| RuntimeError::not_found("schedule", id))?,
            ),
            None => None,
        };

        let record = ScheduleRecord {
            schedule_id: request
                .schedule_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            agent_id: request.agent_id,
            user_id: request.user_id,
            cron_expression: request.cron_expression,
            timezone: request.timezone,
            payload: request.payload,
            priority: request.priority,
            max_retries,
            active: request.active,
            next_run,
            last_run: existing.as_ref().and_then(|s| s.last_run),
            created_at: existing.as_ref().map(|s| s.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.store.upsert_schedule(&record).await
    }

    pub async fn list_schedules(&self) -> RuntimeResult<Vec<ScheduleRecord>> {
        self.store.list_schedules().await
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> RuntimeResult<()> {
        if self.store.remove_schedule(schedule_id).await? {
            Ok(())
        } else {
            Err(RuntimeError::not_found("schedule", schedule_id))
        }
    }
}

fn validate_webhook_url(raw: &str) -> RuntimeResult<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| RuntimeError::Validation(format!("invalid webhook_url '{}': {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        scheme => Err(RuntimeError::Validation(format!(
            "webhook_url must be an http(s) URL with a host (got scheme '{}')",
            scheme
        ))),
    }
}
