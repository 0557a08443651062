use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text-backed enums stored as their snake_case name.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn from_status(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                Self::from_status(text).ok_or_else(|| {
                    FromSqlError::Other(
                        format!("unknown {} '{}'", stringify!($name), text).into(),
                    )
                })
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

text_enum!(JobStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
    Timeout => "timeout",
});

impl JobStatus {
    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Terminal outcomes that count against an agent's health.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMethod {
    #[default]
    Header,
    Query,
    Body,
}

fn default_required() -> bool {
    true
}

fn default_template() -> String {
    crate::core::vault::inject::VALUE_PLACEHOLDER.to_string()
}

/// One credential an agent needs injected into its webhook request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredCredential {
    pub provider: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub injection_method: InjectionMethod,
    /// Header name, query parameter or dotted body path. Defaults depend on
    /// the injection method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default = "default_template")]
    pub format_template: String,
}

impl RequiredCredential {
    pub fn target_key(&self) -> String {
        if let Some(key) = self.key.as_deref()
            && !key.trim().is_empty()
        {
            return key.to_string();
        }
        match self.injection_method {
            InjectionMethod::Header => "Authorization".to_string(),
            InjectionMethod::Query => "api_key".to_string(),
            InjectionMethod::Body => format!("credentials.{}", self.provider),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub webhook_url: String,
    #[serde(default)]
    pub required_credentials: Vec<RequiredCredential>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_required")]
    pub active: bool,
    #[serde(default)]
    pub deactivated_reason: Option<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Expired,
    Revoked,
    Error,
}

text_enum!(CredentialStatus {
    Active => "active",
    Expired => "expired",
    Revoked => "revoked",
    Error => "error",
});

/// Stored credential row. Only ever holds ciphertext.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub user_id: String,
    pub provider: String,
    pub encrypted_blob: String,
    pub status: CredentialStatus,
    pub updated_at: DateTime<Utc>,
}

/// Provider and status for listing; never carries the blob.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub provider: String,
    pub status: CredentialStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub priority: i64,
    pub scheduled_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub output: Option<serde_json::Value>,
    pub duration_ms: Option<u64>,
    pub worker_id: Option<String>,
    pub schedule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Insert request for a job; `retry_count` always starts at zero.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub agent_id: String,
    pub user_id: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: i64,
    pub schedule_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Running,
    IntegrationCall,
    Completed,
    Failed,
    Timeout,
    RetryScheduled,
    Reclaimed,
    Cancelled,
}

text_enum!(Phase {
    Queued => "queued",
    Running => "running",
    IntegrationCall => "integration_call",
    Completed => "completed",
    Failed => "failed",
    Timeout => "timeout",
    RetryScheduled => "retry_scheduled",
    Reclaimed => "reclaimed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub job_id: String,
    pub phase: Phase,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Claiming,
    Dispatching,
    Finalizing,
    Stopped,
}

text_enum!(WorkerPhase {
    Idle => "idle",
    Claiming => "claiming",
    Dispatching => "dispatching",
    Finalizing => "finalizing",
    Stopped => "stopped",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
}

text_enum!(WorkerStatus {
    Online => "online",
    Offline => "offline",
});

#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub phase: WorkerPhase,
    pub active_jobs: u32,
    pub capacity: u32,
    pub capabilities: Option<Vec<String>>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRecord {
    pub schedule_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub cron_expression: String,
    pub timezone: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub max_retries: u32,
    pub active: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_text_roundtrips_through_from_status() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Timeout,
        ] {
            assert_eq!(JobStatus::from_status(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_status("queued"), None);
    }

    #[test]
    fn terminal_and_failure_sets() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Timeout.is_failure());
        assert!(!JobStatus::Cancelled.is_failure());
    }

    #[test]
    fn required_credential_defaults_from_json() {
        let cred: RequiredCredential =
            serde_json::from_value(serde_json::json!({ "provider": "openai" })).unwrap();
        assert!(cred.required);
        assert_eq!(cred.injection_method, InjectionMethod::Header);
        assert_eq!(cred.format_template, "{{value}}");
        assert_eq!(cred.target_key(), "Authorization");
    }

    #[test]
    fn target_key_defaults_per_method() {
        let mut cred = RequiredCredential {
            provider: "github".into(),
            required: true,
            injection_method: InjectionMethod::Body,
            key: None,
            format_template: "{{value}}".into(),
        };
        assert_eq!(cred.target_key(), "credentials.github");
        cred.injection_method = InjectionMethod::Query;
        assert_eq!(cred.target_key(), "api_key");
        cred.key = Some("token".into());
        assert_eq!(cred.target_key(), "token");
    }
}
