use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::core::config::RuntimeConfig;
use crate::core::error::{RuntimeError, RuntimeResult};
use crate::core::store::{RateWindowCount, Store};

/// Stateless count gate in front of enqueue. Counts come from the jobs table,
/// so every process sharing the database sees the same window.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    per_user_agent: Option<u32>,
    per_user: Option<u32>,
}

impl RateLimiter {
    pub fn new(window: Duration, per_user_agent: Option<u32>, per_user: Option<u32>) -> Self {
        Self {
            window,
            per_user_agent,
            per_user,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            Duration::from_secs(config.rate_limit.window_secs.max(1)),
            config.rate_limit.per_user_agent,
            config.rate_limit.per_user,
        )
    }

    #[cfg(test)]
    pub fn unlimited() -> Self {
        Self::new(Duration::from_secs(60), None, None)
    }

    pub async fn check(
        &self,
        store: &Store,
        user_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> RuntimeResult<()> {
        let window = chrono::Duration::from_std(self.window)
            .map_err(|e| anyhow::anyhow!("rate-limit window out of range: {}", e))?;
        let since = now - window;

        if let Some(limit) = self.per_user_agent {
            let counted = store.count_jobs_since(user_id, Some(agent_id), since).await?;
            self.enforce(counted, limit, format!("user '{}' on agent '{}'", user_id, agent_id), now)?;
        }
        if let Some(limit) = self.per_user {
            let counted = store.count_jobs_since(user_id, None, since).await?;
            self.enforce(counted, limit, format!("user '{}'", user_id), now)?;
        }
        Ok(())
    }

    fn enforce(
        &self,
        counted: RateWindowCount,
        limit: u32,
        scope: String,
        now: DateTime<Utc>,
    ) -> RuntimeResult<()> {
        if counted.count < u64::from(limit) {
            return Ok(());
        }
        Err(RuntimeError::RateLimitExceeded {
            scope,
            retry_after_secs: self.retry_after(counted.oldest, now),
        })
    }

    /// Seconds until the oldest counted job leaves the window, at least one.
    fn retry_after(&self, oldest: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
        let window_ms = self.window.as_millis() as i64;
        let remaining_ms = match oldest {
            Some(oldest) => (oldest - now).num_milliseconds() + window_ms,
            None => window_ms,
        };
        let secs = (remaining_ms.max(0) as u64).div_ceil(1000);
        secs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::types::NewJob;
    use crate::core::store::{test_agent, test_store};
    use serde_json::json;

    async fn enqueue(store: &Store, user: &str, agent: &str, schedule_id: Option<&str>) {
        store
            .enqueue_job(NewJob {
                agent_id: agent.to_string(),
                user_id: user.to_string(),
                payload: json!({}),
                priority: 0,
                scheduled_at: None,
                max_retries: 1,
                schedule_id: schedule_id.map(str::to_string),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn per_user_agent_limit_rejects_with_retry_after() {
        let store = test_store();
        store.upsert_agent(&test_agent("a", "http://x")).await.unwrap();
        let limiter = RateLimiter::new(Duration::from_secs(60), Some(2), None);

        enqueue(&store, "u1", "a", None).await;
        limiter.check(&store, "u1", "a", Utc::now()).await.unwrap();
        enqueue(&store, "u1", "a", None).await;

        let err = limiter.check(&store, "u1", "a", Utc::now()).await.unwrap_err();
        match err {
            RuntimeError::RateLimitExceeded { retry_after_secs, .. } => {
                assert!((1..=60).contains(&retry_after_secs));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Other users are unaffected.
        limiter.check(&store, "u2", "a", Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn scheduled_jobs_do_not_count() {
        let store = test_store();
        store.upsert_agent(&test_agent("a", "http://x")).await.unwrap();
        let limiter = RateLimiter::new(Duration::from_secs(60), Some(1), None);
        enqueue(&store, "u1", "a", Some("sched-1")).await;
        limiter.check(&store, "u1", "a", Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn per_user_limit_spans_agents() {
        let store = test_store();
        store.upsert_agent(&test_agent("a", "http://x")).await.unwrap();
        store.upsert_agent(&test_agent("b", "http://x")).await.unwrap();
        let limiter = RateLimiter::new(Duration::from_secs(60), None, Some(2));
        enqueue(&store, "u1", "a", None).await;
        enqueue(&store, "u1", "b", None).await;
        assert!(limiter.check(&store, "u1", "c", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn window_expiry_readmits() {
        let store = test_store();
        store.upsert_agent(&test_agent("a", "http://x")).await.unwrap();
        let limiter = RateLimiter::new(Duration::from_secs(60), Some(1), None);
        enqueue(&store, "u1", "a", None).await;
        let later = Utc::now() + chrono::Duration::seconds(61);
        limiter.check(&store, "u1", "a", later).await.unwrap();
    }

    #[test]
    fn retry_after_rounds_up_and_is_positive() {
        let limiter = RateLimiter::new(Duration::from_secs(60), Some(1), None);
        let now = Utc::now();
        assert_eq!(limiter.retry_after(Some(now - chrono::Duration::milliseconds(59_500)), now), 1);
        assert_eq!(limiter.retry_after(Some(now - chrono::Duration::seconds(90)), now), 1);
        assert_eq!(limiter.retry_after(Some(now - chrono::Duration::milliseconds(10_200)), now), 50);
    }
}
