use thiserror::Error;

use crate::core::store::types::JobStatus;

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Every failure the runtime can report to a caller or record on a job.
///
/// Messages never carry decrypted credential material; variants that relate
/// to credentials only name providers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing required credentials: {}", .providers.join(", "))]
    MissingCredentials { providers: Vec<String> },

    #[error("rate limit exceeded for {scope}; retry after {retry_after_secs}s")]
    RateLimitExceeded {
        scope: String,
        retry_after_secs: u64,
    },

    #[error("stored credential is unreadable: {0}")]
    CredentialCorrupt(String),

    #[error("agent '{0}' is inactive")]
    AgentInactive(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("job '{job_id}' is already {status}")]
    AlreadyTerminal { job_id: String, status: JobStatus },

    #[error("job '{job_id}' is no longer running under worker '{worker_id}'")]
    ConcurrencyViolation { job_id: String, worker_id: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RuntimeError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable machine-readable code used in API bodies and ledger entries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::MissingCredentials { .. } => "missing_credentials",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CredentialCorrupt(_) => "credential_corrupt",
            Self::AgentInactive(_) => "agent_inactive",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyTerminal { .. } => "already_terminal",
            Self::ConcurrencyViolation { .. } => "concurrency_violation",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }
}
