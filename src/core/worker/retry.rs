use std::time::Duration;

use crate::core::store::types::JobStatus;

/// Why a dispatch attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Http,
    Network,
    Timeout,
    CredentialCorrupt,
    /// The worker holding the job stopped heartbeating.
    WorkerLost,
    /// The runtime failed after claiming the job, before any outcome.
    Internal,
}

impl FailureKind {
    /// Status recorded when this failure exhausts the retry budget.
    pub fn terminal_status(self) -> JobStatus {
        match self {
            Self::Timeout | Self::WorkerLost => JobStatus::Timeout,
            _ => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { retry_count: u32, delay: Duration },
    GiveUp { status: JobStatus },
}

/// Exponential backoff: `base * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(30 * 60))
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// `max_retries` is the total attempt budget: a failed attempt is retried
    /// while `retry_count + 1 < max_retries`.
    pub fn decide(&self, retry_count: u32, max_retries: u32, kind: FailureKind) -> RetryDecision {
        if retry_count.saturating_add(1) < max_retries {
            RetryDecision::Retry {
                retry_count: retry_count + 1,
                delay: self.backoff(retry_count),
            }
        } else {
            RetryDecision::GiveUp {
                status: kind.terminal_status(),
            }
        }
    }
}
