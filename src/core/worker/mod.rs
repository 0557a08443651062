//! Worker pool: each worker claims due jobs up to its capacity, dispatches
//! them concurrently and finalizes them through the retry policy.
//!
//! Per-worker phases move idle -> claiming -> dispatching -> finalizing ->
//! idle; shutdown moves any phase to stopped. A worker's in-flight count never
//! exceeds its capacity because it only ever claims its free slots.

pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::RuntimeConfig;
use crate::core::dispatcher::{Invoker, Outcome};
use crate::core::error::{RuntimeError, RuntimeResult};
use crate::core::feedback::{self, FeedbackPolicy};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::types::{JobRecord, JobStatus, Phase, WorkerPhase};
use crate::core::store::{ClaimRequest, Finalization, Store};
use crate::core::vault::CredentialVault;
use retry::{FailureKind, RetryDecision, RetryPolicy};

/// Everything a worker needs besides its own state.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Store,
    pub vault: Arc<CredentialVault>,
    pub invoker: Arc<dyn Invoker>,
    pub retry: RetryPolicy,
    pub feedback: FeedbackPolicy,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub capacity: usize,
    pub capabilities: Option<Vec<String>>,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            capacity: config.worker.capacity.max(1),
            capabilities: config.worker.capabilities.clone(),
            heartbeat_interval: config.heartbeat_interval().max(Duration::from_millis(10)),
            stale_after: config.heartbeat_grace(),
        }
    }
}

/// Snapshot of one worker, persisted by every heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub id: String,
    pub heartbeat: DateTime<Utc>,
    pub active_jobs: usize,
    pub phase: WorkerPhase,
}

#[derive(Debug, Default)]
struct Activity {
    claiming: bool,
    dispatching: usize,
    finalizing: usize,
    stopped: bool,
}

struct Tracked {
    state: WorkerState,
    activity: Activity,
    /// Jobs still marked running under this worker because releasing them
    /// after an error failed too. Retried every claim cycle.
    unreleased: Vec<(JobRecord, String)>,
}

impl Tracked {
    fn refresh(&mut self) {
        let a = &self.activity;
        self.state.phase = if a.stopped {
            WorkerPhase::Stopped
        } else if a.claiming {
            WorkerPhase::Claiming
        } else if a.dispatching > 0 {
            WorkerPhase::Dispatching
        } else if a.finalizing > 0 {
            WorkerPhase::Finalizing
        } else {
            WorkerPhase::Idle
        };
    }
}

type SharedTracked = Arc<Mutex<Tracked>>;

async fn update(tracked: &SharedTracked, f: impl FnOnce(&mut Tracked)) {
    let mut guard = tracked.lock().await;
    f(&mut guard);
    guard.refresh();
}

pub struct Worker {
    ctx: WorkerContext,
    settings: WorkerSettings,
    tracked: SharedTracked,
}

impl Worker {
    pub fn new(id: impl Into<String>, ctx: WorkerContext, settings: WorkerSettings) -> Self {
        let state = WorkerState {
            id: id.into(),
            heartbeat: Utc::now(),
            active_jobs: 0,
            phase: WorkerPhase::Idle,
        };
        Self {
            ctx,
            settings,
            tracked: Arc::new(Mutex::new(Tracked {
                state,
                activity: Activity::default(),
                unreleased: Vec::new(),
            })),
        }
    }

    pub async fn state(&self) -> WorkerState {
        self.tracked.lock().await.state.clone()
    }

    async fn id(&self) -> String {
        self.tracked.lock().await.state.id.clone()
    }

    pub async fn register(&self) -> RuntimeResult<()> {
        let id = self.id().await;
        self.ctx
            .store
            .register_worker(&id, self.settings.capacity, self.settings.capabilities.as_deref())
            .await
    }

    pub async fn heartbeat(&self) -> RuntimeResult<()> {
        let snapshot = {
            let mut guard = self.tracked.lock().await;
            guard.state.heartbeat = Utc::now();
            guard.state.clone()
        };
        let known = self
            .ctx
            .store
            .record_heartbeat(&snapshot.id, snapshot.active_jobs, snapshot.phase)
            .await?;
        if !known {
            warn!(worker_id = %snapshot.id, "Worker row missing, re-registering");
            self.register().await?;
        }
        Ok(())
    }

    async fn claim(&self, free: usize) -> RuntimeResult<Vec<JobRecord>> {
        if free == 0 {
            return Ok(Vec::new());
        }
        let id = self.id().await;
        update(&self.tracked, |t| t.activity.claiming = true).await;
        let claimed = self
            .ctx
            .store
            .claim_jobs(ClaimRequest {
                worker_id: &id,
                capacity: free,
                capabilities: self.settings.capabilities.as_deref(),
                stale_after: self.settings.stale_after,
                retry: &self.ctx.retry,
            })
            .await;
        update(&self.tracked, |t| {
            t.activity.claiming = false;
            if let Ok(batch) = &claimed {
                t.state.active_jobs += batch.jobs.len();
            }
        })
        .await;
        let batch = claimed?;
        if !batch.jobs.is_empty() {
            debug!(worker_id = %id, count = batch.jobs.len(), "Claimed jobs");
        }
        self.review_expired(&batch.expired_agents).await;
        Ok(batch.jobs)
    }

    /// Jobs the reclaim sweep timed out never pass through `finalize`, so
    /// their agents are checked here.
    async fn review_expired(&self, agents: &[String]) {
        let unique: BTreeSet<&str> = agents.iter().map(String::as_str).collect();
        for agent_id in unique {
            let checked =
                feedback::evaluate_agent(&self.ctx.store, agent_id, &self.ctx.feedback).await;
            if let Err(e) = checked {
                warn!(agent_id = %agent_id, "Feedback check after reclaim failed: {}", e);
            }
        }
    }

    async fn retry_releases(&self) {
        let pending = std::mem::take(&mut self.tracked.lock().await.unreleased);
        if pending.is_empty() {
            return;
        }
        let id = self.id().await;
        for (job, cause) in pending {
            release_after_error(&self.ctx, &self.tracked, &id, &job, cause).await;
        }
    }

    fn spawn_job(&self, set: &mut JoinSet<()>, worker_id: String, job: JobRecord) {
        let ctx = self.ctx.clone();
        let tracked = self.tracked.clone();
        set.spawn(async move {
            if let Err(e) = process_job(&ctx, &tracked, &worker_id, &job).await {
                error!(worker_id = %worker_id, job_id = %job.job_id, "Job processing failed: {}", e);
                release_after_error(&ctx, &tracked, &worker_id, &job, e.to_string()).await;
            }
            update(&tracked, |t| {
                t.state.active_jobs = t.state.active_jobs.saturating_sub(1);
            })
            .await;
        });
    }

    async fn fill_slots(&self, set: &mut JoinSet<()>) {
        self.retry_releases().await;
        let free = self.settings.capacity.saturating_sub(set.len());
        match self.claim(free).await {
            Ok(jobs) => {
                let id = self.id().await;
                for job in jobs {
                    self.spawn_job(set, id.clone(), job);
                }
            }
            Err(e) => error!("Claim cycle failed: {}", e),
        }
    }

    /// One full cycle: claim up to capacity, process everything claimed, and
    /// return how many jobs were handled.
    #[cfg(test)]
    pub async fn run_once(&self) -> RuntimeResult<usize> {
        self.retry_releases().await;
        let jobs = self.claim(self.settings.capacity).await?;
        let count = jobs.len();
        let id = self.id().await;
        let mut set = JoinSet::new();
        for job in jobs {
            self.spawn_job(&mut set, id.clone(), job);
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(worker_id = %id, "Job task aborted: {}", e);
            }
        }
        Ok(count)
    }

    /// Main loop. Claims whenever woken by the poller or when a slot frees
    /// up; on cancellation lets in-flight dispatches finish, then goes
    /// offline.
    pub async fn run(self: Arc<Self>, wake: Arc<Notify>, cancel: CancellationToken) {
        let id = self.id().await;
        if let Err(e) = self.register().await {
            error!(worker_id = %id, "Worker registration failed: {}", e);
        }
        info!(worker_id = %id, capacity = self.settings.capacity, "Worker started");

        let heartbeat = {
            let worker = self.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(worker.settings.heartbeat_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = worker.heartbeat().await {
                                warn!("Heartbeat failed: {}", e);
                            }
                        }
                    }
                }
            })
        };

        let mut inflight: JoinSet<()> = JoinSet::new();
        self.fill_slots(&mut inflight).await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake.notified() => self.fill_slots(&mut inflight).await,
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        error!(worker_id = %id, "Job task aborted: {}", e);
                    }
                    self.fill_slots(&mut inflight).await;
                }
            }
        }

        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                error!(worker_id = %id, "Job task aborted during shutdown: {}", e);
            }
        }
        let _ = heartbeat.await;
        update(&self.tracked, |t| t.activity.stopped = true).await;
        if let Err(e) = self.ctx.store.mark_worker_offline(&id).await {
            warn!(worker_id = %id, "Failed to mark worker offline: {}", e);
        }
        info!(worker_id = %id, "Worker stopped");
    }
}

/// Persist the end of an attempt. Only `dispatched` attempts, ones that
/// reached the webhook, feed the agent's failure check.
async fn finalize(
    ctx: &WorkerContext,
    tracked: &SharedTracked,
    worker_id: &str,
    job: &JobRecord,
    finalization: Finalization,
    details: serde_json::Value,
    dispatched: bool,
) -> RuntimeResult<Option<JobRecord>> {
    update(tracked, |t| t.activity.finalizing += 1).await;
    let result = ctx
        .store
        .finalize_job(&job.job_id, worker_id, &finalization, details)
        .await;
    update(tracked, |t| t.activity.finalizing -= 1).await;

    match result {
        Ok(done) => {
            match done.status {
                JobStatus::Completed => {
                    info!(job_id = %done.job_id, agent_id = %done.agent_id, "Job completed")
                }
                JobStatus::Pending => info!(
                    job_id = %done.job_id,
                    retry_count = done.retry_count,
                    "Job scheduled for retry at {}",
                    done.scheduled_at
                ),
                status => warn!(
                    job_id = %done.job_id,
                    agent_id = %done.agent_id,
                    "Job ended {}: {}",
                    status,
                    done.last_error.as_deref().unwrap_or("")
                ),
            }
            if dispatched
                && done.status.is_failure()
                && let Err(e) =
                    feedback::evaluate_agent(&ctx.store, &done.agent_id, &ctx.feedback).await
            {
                warn!(agent_id = %done.agent_id, "Feedback check failed: {}", e);
            }
            Ok(Some(done))
        }
        Err(RuntimeError::ConcurrencyViolation { job_id, worker_id }) => {
            warn!(
                job_id = %job_id,
                worker_id = %worker_id,
                "Job left running state before finalize (cancelled or reclaimed); dropping result"
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Close out a job whose processing hit a runtime error after the claim so it
/// does not stay running under a live worker. When even that fails the job
/// is parked and retried next cycle.
async fn release_after_error(
    ctx: &WorkerContext,
    tracked: &SharedTracked,
    worker_id: &str,
    job: &JobRecord,
    cause: String,
) {
    let finalization = failure_finalization(
        &ctx.retry,
        job,
        FailureKind::Internal,
        format!("internal error: {}", cause),
        None,
    );
    let details = json!({ "attempt": job.retry_count + 1, "error_code": "internal_error" });
    if let Err(e) = finalize(ctx, tracked, worker_id, job, finalization, details, false).await {
        error!(worker_id = %worker_id, job_id = %job.job_id, "Could not release job: {}", e);
        tracked.lock().await.unreleased.push((job.clone(), cause));
    }
}

/// Failure path shared by dispatch and credential errors.
fn failure_finalization(
    retry: &RetryPolicy,
    job: &JobRecord,
    kind: FailureKind,
    error: String,
    duration_ms: Option<u64>,
) -> Finalization {
    match retry.decide(job.retry_count, job.max_retries, kind) {
        RetryDecision::Retry { retry_count, delay } => Finalization::Retry {
            error,
            retry_count,
            delay,
            duration_ms,
        },
        RetryDecision::GiveUp { status } => Finalization::Terminal {
            status,
            error,
            duration_ms,
        },
    }
}

/// Carry one claimed job through resolve, dispatch and finalize. Returns the
/// finalized record, or `None` when the job was cancelled or taken away.
async fn process_job(
    ctx: &WorkerContext,
    tracked: &SharedTracked,
    worker_id: &str,
    job: &JobRecord,
) -> RuntimeResult<Option<JobRecord>> {
    let attempt = job.retry_count + 1;

    let agent = match ctx.store.get_agent(&job.agent_id).await? {
        Some(agent) if agent.active => agent,
        found => {
            let error = match found {
                Some(_) => format!("agent '{}' is inactive", job.agent_id),
                None => format!("agent '{}' not found", job.agent_id),
            };
            let finalization = Finalization::Terminal {
                status: JobStatus::Failed,
                error,
                duration_ms: None,
            };
            let details = json!({ "attempt": attempt, "error_code": "agent_unavailable" });
            return finalize(ctx, tracked, worker_id, job, finalization, details, false).await;
        }
    };

    if !ctx.store.is_job_held_by(&job.job_id, worker_id).await? {
        info!(job_id = %job.job_id, "Job cancelled before dispatch");
        return Ok(None);
    }

    let resolution = match ctx.vault.resolve(&job.user_id, &agent.required_credentials).await {
        Ok(resolution) => resolution,
        Err(RuntimeError::CredentialCorrupt(reason)) => {
            let error = format!("stored credential is unreadable: {}", reason);
            let finalization =
                failure_finalization(&ctx.retry, job, FailureKind::CredentialCorrupt, error, None);
            return finalize(
                ctx,
                tracked,
                worker_id,
                job,
                finalization,
                json!({ "attempt": attempt, "error_code": "credential_corrupt" }),
                false,
            )
            .await;
        }
        Err(e) => return Err(e),
    };

    if !resolution.missing.is_empty() {
        let error = RuntimeError::MissingCredentials {
            providers: resolution.missing.clone(),
        }
        .to_string();
        let finalization = Finalization::Terminal {
            status: JobStatus::Failed,
            error,
            duration_ms: None,
        };
        return finalize(
            ctx,
            tracked,
            worker_id,
            job,
            finalization,
            json!({
                "attempt": attempt,
                "error_code": "missing_credentials",
                "missing": resolution.missing,
            }),
            false,
        )
        .await;
    }

    ctx.store
        .append_phase(
            &job.job_id,
            Phase::IntegrationCall,
            None,
            json!({
                "worker_id": worker_id,
                "attempt": attempt,
                "providers": resolution.resolved.providers(),
            }),
        )
        .await?;

    update(tracked, |t| t.activity.dispatching += 1).await;
    let outcome = ctx.invoker.invoke(&agent, job, &resolution.resolved).await;
    update(tracked, |t| t.activity.dispatching -= 1).await;
    drop(resolution);

    let (finalization, details) = match outcome {
        Outcome::Success {
            status_code,
            body,
            duration_ms,
            truncated,
        } => (
            Finalization::Completed {
                output: body,
                duration_ms,
            },
            json!({ "attempt": attempt, "status_code": status_code, "truncated": truncated }),
        ),
        failed => {
            let kind = failed.failure_kind().unwrap_or(FailureKind::Network);
            let details = json!({ "attempt": attempt, "outcome": failed });
            let finalization = failure_finalization(
                &ctx.retry,
                job,
                kind,
                failed.describe(),
                Some(failed.duration_ms()),
            );
            (finalization, details)
        }
    };
    finalize(ctx, tracked, worker_id, job, finalization, details, true).await
}

/// Fixed-size set of workers sharing one store and one wake signal.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        ctx: WorkerContext,
        settings: WorkerSettings,
        count: usize,
        wake: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "host".to_string());
        let workers = (0..count.max(1))
            .map(|i| {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                let id = format!("{}-{}-{}", host, i, &suffix[..8]);
                Arc::new(Worker::new(id, ctx.clone(), settings.clone()))
            })
            .collect();
        Self {
            workers,
            wake,
            cancel,
            handles: Vec::new(),
        }
    }
}

#[async_trait]
impl LifecycleComponent for WorkerPool {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        for worker in &self.workers {
            let handle = tokio::spawn(worker.clone().run(self.wake.clone(), self.cancel.clone()));
            self.handles.push(handle);
        }
        info!("Worker pool started ({} workers)", self.workers.len());
        Ok(())
    }

    async fn on_shutdown(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
        Ok(())
    }
}
