//! Poller: promotes due cron schedules into jobs and wakes the workers on a
//! fixed interval.

pub mod cron;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::RuntimeResult;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::types::ScheduleRecord;
use crate::core::store::{Promotion, Store};

/// What one poll cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub enqueued: usize,
    pub skipped: usize,
}

pub struct Poller {
    store: Store,
    wake: Arc<Notify>,
    interval: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn new(store: Store, wake: Arc<Notify>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            store,
            wake,
            interval: interval.max(Duration::from_millis(10)),
            cancel,
            handle: None,
        }
    }

    /// Promote every schedule due at `now`, then wake the workers so they
    /// pick up whatever became claimable (new occurrences, retries whose
    /// backoff elapsed, delayed jobs).
    pub async fn tick(&self, now: DateTime<Utc>) -> RuntimeResult<TickReport> {
        let mut report = TickReport::default();
        for schedule in self.store.due_schedules(now).await? {
            match promote(&self.store, &schedule, now).await {
                Ok(Promotion::Enqueued(job)) => {
                    report.enqueued += 1;
                    debug!(schedule_id = %schedule.schedule_id, job_id = %job.job_id, "Schedule fired");
                }
                Ok(Promotion::Skipped) => report.skipped += 1,
                Ok(Promotion::Raced) => {}
                Err(e) => warn!(schedule_id = %schedule.schedule_id, "Schedule promotion failed: {}", e),
            }
        }
        self.wake.notify_waiters();
        Ok(report)
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!("Poll cycle failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Missed occurrences collapse into one: the following run is computed from
/// `now`, not from the stale `next_run`.
async fn promote(
    store: &Store,
    schedule: &ScheduleRecord,
    now: DateTime<Utc>,
) -> RuntimeResult<Promotion> {
    let following = cron::next_run_after(&schedule.cron_expression, &schedule.timezone, now)?;
    let agent_active = store
        .get_agent(&schedule.agent_id)
        .await?
        .is_some_and(|agent| agent.active);
    if !agent_active {
        debug!(
            schedule_id = %schedule.schedule_id,
            agent_id = %schedule.agent_id,
            "Agent unavailable, skipping occurrence"
        );
    }
    store.promote_schedule(schedule, following, agent_active).await
}

#[async_trait]
impl LifecycleComponent for Poller {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        let poller = Poller {
            store: self.store.clone(),
            wake: self.wake.clone(),
            interval: self.interval,
            cancel: self.cancel.clone(),
            handle: None,
        };
        self.handle = Some(tokio::spawn(async move { poller.run().await }));
        info!("Poller started (every {}ms)", self.interval.as_millis());
        Ok(())
    }

    async fn on_shutdown(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        info!("Poller stopped");
        Ok(())
    }
}
