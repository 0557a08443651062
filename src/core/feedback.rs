use tracing::warn;

use crate::core::config::RuntimeConfig;
use crate::core::error::RuntimeResult;
use crate::core::store::Store;

/// Sliding-window failure rule: an agent with `threshold` failed or timed out
/// executions among its last `window` is deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackPolicy {
    pub window: usize,
    pub threshold: usize,
}

impl Default for FeedbackPolicy {
    fn default() -> Self {
        Self {
            window: 5,
            threshold: 3,
        }
    }
}

impl FeedbackPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            window: config.feedback.window.max(1),
            threshold: config.feedback.threshold.max(1),
        }
    }
}

/// Re-evaluate an agent after a terminal failure. Returns true when this call
/// deactivated it.
pub async fn evaluate_agent(
    store: &Store,
    agent_id: &str,
    policy: &FeedbackPolicy,
) -> RuntimeResult<bool> {
    let outcomes = store.recent_outcomes(agent_id, policy.window).await?;
    let failures = outcomes.iter().filter(|s| s.is_failure()).count();
    if failures < policy.threshold {
        return Ok(false);
    }

    let reason = format!(
        "{} of the last {} executions failed",
        failures,
        outcomes.len()
    );
    let deactivated = store.deactivate_agent(agent_id, &reason).await?;
    if deactivated {
        warn!(agent_id = %agent_id, "Agent deactivated: {}", reason);
    }
    Ok(deactivated)
}
