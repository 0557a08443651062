use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::json;
use std::time::Duration;

use super::ledger::insert_phase;
use super::types::{JobRecord, JobStatus, NewJob, Phase};
use super::{Store, from_millis, json_column, opt_from_millis, opt_json_column, to_millis};
use crate::core::error::{RuntimeError, RuntimeResult};
use crate::core::worker::retry::{FailureKind, RetryDecision, RetryPolicy};

const JOB_COLUMNS: &str = "job_id, agent_id, user_id, status, priority, scheduled_at, payload, \
     retry_count, max_retries, last_error, output, duration_ms, worker_id, schedule_id, \
     created_at, started_at, completed_at, updated_at";

/// Upper bound accepted for `max_retries`.
pub const MAX_RETRIES_LIMIT: i64 = 100;

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        job_id: row.get(0)?,
        agent_id: row.get(1)?,
        user_id: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        scheduled_at: from_millis(row.get(5)?),
        payload: json_column(row, 6)?,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        last_error: row.get(9)?,
        output: opt_json_column(row, 10)?,
        duration_ms: row.get::<_, Option<i64>>(11)?.map(|d| d.max(0) as u64),
        worker_id: row.get(12)?,
        schedule_id: row.get(13)?,
        created_at: from_millis(row.get(14)?),
        started_at: opt_from_millis(row.get(15)?),
        completed_at: opt_from_millis(row.get(16)?),
        updated_at: from_millis(row.get(17)?),
    })
}

/// Parameters of one claim cycle.
pub struct ClaimRequest<'a> {
    pub worker_id: &'a str,
    pub capacity: usize,
    /// Providers the claiming worker can serve; `None` accepts every job.
    pub capabilities: Option<&'a [String]>,
    /// Running jobs older than this whose worker stopped heartbeating are
    /// reclaimed before new work is handed out.
    pub stale_after: Duration,
    pub retry: &'a RetryPolicy,
}

/// Jobs handed to one worker, plus the agents whose jobs the reclaim sweep
/// ended terminally during the same cycle.
#[derive(Debug, Default)]
pub struct ClaimBatch {
    pub jobs: Vec<JobRecord>,
    pub expired_agents: Vec<String>,
}

/// How a worker closes out a running job.
#[derive(Debug, Clone)]
pub enum Finalization {
    Completed {
        output: serde_json::Value,
        duration_ms: u64,
    },
    Retry {
        error: String,
        retry_count: u32,
        delay: Duration,
        duration_ms: Option<u64>,
    },
    Terminal {
        status: JobStatus,
        error: String,
        duration_ms: Option<u64>,
    },
}

impl Finalization {
    fn phase(&self) -> Phase {
        match self {
            Self::Completed { .. } => Phase::Completed,
            Self::Retry { .. } => Phase::RetryScheduled,
            Self::Terminal {
                status: JobStatus::Timeout,
                ..
            } => Phase::Timeout,
            Self::Terminal { .. } => Phase::Failed,
        }
    }

    fn duration_ms(&self) -> Option<u64> {
        match self {
            Self::Completed { duration_ms, .. } => Some(*duration_ms),
            Self::Retry { duration_ms, .. } | Self::Terminal { duration_ms, .. } => *duration_ms,
        }
    }
}

/// Jobs created by one caller inside a rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindowCount {
    pub count: u64,
    pub oldest: Option<DateTime<Utc>>,
}

pub(super) fn validate_new_job(job: &NewJob) -> RuntimeResult<()> {
    if job.agent_id.trim().is_empty() {
        return Err(RuntimeError::Validation("agent_id must not be empty".into()));
    }
    if job.user_id.trim().is_empty() {
        return Err(RuntimeError::Validation("user_id must not be empty".into()));
    }
    if job.max_retries < 0 {
        return Err(RuntimeError::Validation(format!(
            "max_retries must be >= 0 (got {})",
            job.max_retries
        )));
    }
    if job.max_retries > MAX_RETRIES_LIMIT {
        return Err(RuntimeError::Validation(format!(
            "max_retries must be <= {} (got {})",
            MAX_RETRIES_LIMIT, job.max_retries
        )));
    }
    Ok(())
}

/// Insert a pending job plus its `queued` ledger row on an open transaction.
pub(super) fn insert_job(
    conn: &Connection,
    job: &NewJob,
    now: DateTime<Utc>,
) -> RuntimeResult<JobRecord> {
    let job_id = uuid::Uuid::new_v4().to_string();
    let scheduled_at = job.scheduled_at.unwrap_or(now);
    conn.execute(
        "INSERT INTO jobs (job_id, agent_id, user_id, status, priority, scheduled_at, payload,
                           retry_count, max_retries, schedule_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, 0, ?7, ?8, ?9, ?9)",
        params![
            job_id,
            job.agent_id,
            job.user_id,
            job.priority,
            to_millis(scheduled_at),
            serde_json::to_string(&job.payload)?,
            job.max_retries,
            job.schedule_id,
            to_millis(now)
        ],
    )?;
    insert_phase(
        conn,
        &job_id,
        Phase::Queued,
        now,
        None,
        &json!({
            "priority": job.priority,
            "scheduled_at": scheduled_at,
            "schedule_id": job.schedule_id,
        }),
    )?;
    let record = conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
        params![job_id],
        job_from_row,
    )?;
    Ok(record)
}

/// Requeue or time out running jobs whose worker went silent. Returns the
/// agent of every job that ended here, one entry per job.
fn reclaim_stale(
    conn: &Connection,
    now: DateTime<Utc>,
    stale_after: Duration,
    retry: &RetryPolicy,
) -> RuntimeResult<Vec<String>> {
    let now_ms = to_millis(now);
    let cutoff = now_ms.saturating_sub(stale_after.as_millis() as i64);
    let stale: Vec<(String, String, Option<String>, u32, u32)> = {
        let mut stmt = conn.prepare(
            "SELECT j.job_id, j.agent_id, j.worker_id, j.retry_count, j.max_retries FROM jobs j
             WHERE j.status = 'running' AND j.started_at <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM workers w
                   WHERE w.worker_id = j.worker_id
                     AND w.status = 'online'
                     AND w.last_heartbeat > ?1
               )",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut expired = Vec::new();
    for (job_id, agent_id, worker_id, retry_count, max_retries) in stale {
        let lost = worker_id.as_deref().unwrap_or("unknown");
        let error = format!("worker '{}' stopped heartbeating mid-dispatch", lost);
        let rows = match retry.decide(retry_count, max_retries, FailureKind::WorkerLost) {
            RetryDecision::Retry { retry_count, delay } => {
                let scheduled_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                let rows = conn.execute(
                    "UPDATE jobs SET status = 'pending', retry_count = ?2, scheduled_at = ?3,
                                     last_error = ?4, worker_id = NULL, updated_at = ?5
                     WHERE job_id = ?1 AND status = 'running'",
                    params![job_id, retry_count, to_millis(scheduled_at), error, now_ms],
                )?;
                if rows > 0 {
                    insert_phase(
                        conn,
                        &job_id,
                        Phase::Reclaimed,
                        now,
                        None,
                        &json!({
                            "worker_id": worker_id,
                            "next": "retry",
                            "retry_count": retry_count,
                            "scheduled_at": scheduled_at,
                        }),
                    )?;
                }
                rows
            }
            RetryDecision::GiveUp { status } => {
                let rows = conn.execute(
                    "UPDATE jobs SET status = ?2, last_error = ?3, completed_at = ?4, updated_at = ?4
                     WHERE job_id = ?1 AND status = 'running'",
                    params![job_id, status, error, now_ms],
                )?;
                if rows > 0 {
                    insert_phase(
                        conn,
                        &job_id,
                        Phase::Reclaimed,
                        now,
                        None,
                        &json!({ "worker_id": worker_id, "next": status }),
                    )?;
                    expired.push(agent_id);
                }
                rows
            }
        };
        if rows > 0 {
            tracing::warn!(job_id = %job_id, worker_id = %lost, "Reclaimed job from stale worker");
        }
    }
    Ok(expired)
}

impl Store {
    pub async fn enqueue_job(&self, job: NewJob) -> RuntimeResult<JobRecord> {
        validate_new_job(&job)?;
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let record = insert_job(&tx, &job, Utc::now())?;
        tx.commit()?;
        Ok(record)
    }

    /// Hand out up to `capacity` due jobs to one worker.
    ///
    /// The transition to `running` is a single `UPDATE ... WHERE status =
    /// 'pending' RETURNING`, so two claimers can never both receive a row.
    pub async fn claim_jobs(&self, req: ClaimRequest<'_>) -> RuntimeResult<ClaimBatch> {
        if req.capacity == 0 {
            return Ok(ClaimBatch::default());
        }
        let capabilities = match req.capabilities {
            Some(caps) => Some(serde_json::to_string(caps)?),
            None => None,
        };
        let now = Utc::now();
        let now_ms = to_millis(now);

        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let expired_agents = reclaim_stale(&tx, now, req.stale_after, req.retry)?;

        let mut claimed = {
            let mut stmt = tx.prepare(&format!(
                "UPDATE jobs
                 SET status = 'running', started_at = ?1, updated_at = ?1, worker_id = ?2
                 WHERE seq IN (
                     SELECT j.seq FROM jobs j
                     WHERE j.status = 'pending'
                       AND j.scheduled_at <= ?1
                       AND (?4 IS NULL OR NOT EXISTS (
                           SELECT 1 FROM agents a, json_each(a.required_credentials) rc
                           WHERE a.agent_id = j.agent_id
                             AND COALESCE(json_extract(rc.value, '$.required'), 1)
                             AND json_extract(rc.value, '$.provider')
                                 NOT IN (SELECT value FROM json_each(?4))
                       ))
                     ORDER BY j.priority DESC, j.created_at ASC, j.seq ASC
                     LIMIT ?3
                 )
                 AND status = 'pending'
                 RETURNING {JOB_COLUMNS}, seq"
            ))?;
            let rows = stmt.query_map(
                params![now_ms, req.worker_id, req.capacity as i64, capabilities],
                |row| Ok((row.get::<_, i64>(18)?, job_from_row(row)?)),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        // RETURNING order is unspecified.
        claimed.sort_by(|(a_seq, a), (b_seq, b)| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a_seq.cmp(b_seq))
        });
        let claimed: Vec<JobRecord> = claimed.into_iter().map(|(_, job)| job).collect();

        for job in &claimed {
            insert_phase(
                &tx,
                &job.job_id,
                Phase::Running,
                now,
                None,
                &json!({ "worker_id": req.worker_id, "attempt": job.retry_count + 1 }),
            )?;
        }
        tx.commit()?;
        Ok(ClaimBatch {
            jobs: claimed,
            expired_agents,
        })
    }

    /// Close out a job held by `worker_id`. Fails with `ConcurrencyViolation`
    /// when the job is no longer running under that worker (cancelled,
    /// reclaimed or already finalized).
    pub async fn finalize_job(
        &self,
        job_id: &str,
        worker_id: &str,
        finalization: &Finalization,
        details: serde_json::Value,
    ) -> RuntimeResult<JobRecord> {
        let now = Utc::now();
        let now_ms = to_millis(now);
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = match finalization {
            Finalization::Completed {
                output,
                duration_ms,
            } => tx
                .query_row(
                    &format!(
                        "UPDATE jobs SET status = 'completed', output = ?3, duration_ms = ?4,
                                         last_error = NULL, completed_at = ?5, updated_at = ?5
                         WHERE job_id = ?1 AND status = 'running' AND worker_id = ?2
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![
                        job_id,
                        worker_id,
                        serde_json::to_string(output)?,
                        *duration_ms as i64,
                        now_ms
                    ],
                    job_from_row,
                )
                .optional()?,
            Finalization::Retry {
                error,
                retry_count,
                delay,
                duration_ms,
            } => {
                let scheduled_at = now + chrono::Duration::from_std(*delay).unwrap_or_default();
                tx.query_row(
                    &format!(
                        "UPDATE jobs SET status = 'pending', retry_count = ?3, scheduled_at = ?4,
                                         last_error = ?5, duration_ms = ?6, worker_id = NULL,
                                         updated_at = ?7
                         WHERE job_id = ?1 AND status = 'running' AND worker_id = ?2
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![
                        job_id,
                        worker_id,
                        retry_count,
                        to_millis(scheduled_at),
                        error,
                        duration_ms.map(|d| d as i64),
                        now_ms
                    ],
                    job_from_row,
                )
                .optional()?
            }
            Finalization::Terminal {
                status,
                error,
                duration_ms,
            } => {
                if !status.is_failure() {
                    return Err(RuntimeError::Validation(format!(
                        "cannot finalize job '{}' as {}",
                        job_id, status
                    )));
                }
                tx.query_row(
                    &format!(
                        "UPDATE jobs SET status = ?3, last_error = ?4, duration_ms = ?5,
                                         completed_at = ?6, updated_at = ?6
                         WHERE job_id = ?1 AND status = 'running' AND worker_id = ?2
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![
                        job_id,
                        worker_id,
                        status,
                        error,
                        duration_ms.map(|d| d as i64),
                        now_ms
                    ],
                    job_from_row,
                )
                .optional()?
            }
        };

        let Some(job) = updated else {
            return Err(RuntimeError::ConcurrencyViolation {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        };
        insert_phase(
            &tx,
            job_id,
            finalization.phase(),
            now,
            finalization.duration_ms(),
            &details,
        )?;
        tx.commit()?;
        Ok(job)
    }

    /// Cancel a pending or running job. A running job's worker notices at
    /// its next check or when its finalize no longer matches.
    pub async fn cancel_job(&self, job_id: &str, reason: &str) -> RuntimeResult<JobRecord> {
        let now = Utc::now();
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx
            .query_row(
                &format!(
                    "UPDATE jobs SET status = 'cancelled', last_error = ?2,
                                     completed_at = ?3, updated_at = ?3
                     WHERE job_id = ?1 AND status IN ('pending', 'running')
                     RETURNING {JOB_COLUMNS}"
                ),
                params![job_id, reason, to_millis(now)],
                job_from_row,
            )
            .optional()?;

        match updated {
            Some(job) => {
                insert_phase(
                    &tx,
                    job_id,
                    Phase::Cancelled,
                    now,
                    None,
                    &json!({ "reason": reason, "worker_id": job.worker_id }),
                )?;
                tx.commit()?;
                Ok(job)
            }
            None => {
                let status: Option<JobStatus> = tx
                    .query_row(
                        "SELECT status FROM jobs WHERE job_id = ?1",
                        params![job_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match status {
                    Some(status) => Err(RuntimeError::AlreadyTerminal {
                        job_id: job_id.to_string(),
                        status,
                    }),
                    None => Err(RuntimeError::not_found("job", job_id)),
                }
            }
        }
    }

    pub async fn get_job(&self, job_id: &str) -> RuntimeResult<Option<JobRecord>> {
        let db = self.db.lock().await;
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Most recently created jobs first.
    pub async fn list_jobs(&self, limit: usize) -> RuntimeResult<Vec<JobRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY seq DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], job_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// True while the job is still running under `worker_id`.
    pub async fn is_job_held_by(&self, job_id: &str, worker_id: &str) -> RuntimeResult<bool> {
        let db = self.db.lock().await;
        let held = db
            .query_row(
                "SELECT 1 FROM jobs WHERE job_id = ?1 AND status = 'running' AND worker_id = ?2",
                params![job_id, worker_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(held.is_some())
    }

    /// Statuses of the agent's latest terminal executions, newest first.
    /// Cancelled jobs are not executions and are skipped, as are jobs whose
    /// final attempt ended before the webhook was called.
    pub async fn recent_outcomes(
        &self,
        agent_id: &str,
        window: usize,
    ) -> RuntimeResult<Vec<JobStatus>> {
        let db = self.db.lock().await;
        // Only attempts that reached the webhook say anything about the agent.
        let mut stmt = db.prepare(
            "SELECT j.status FROM jobs j
             WHERE j.agent_id = ?1 AND j.status IN ('completed', 'failed', 'timeout')
               AND EXISTS (
                   SELECT 1 FROM ledger l
                   WHERE l.job_id = j.job_id
                     AND l.phase = 'integration_call'
                     AND json_extract(l.data, '$.attempt') = j.retry_count + 1
               )
             ORDER BY j.completed_at DESC, j.seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id, window as i64], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Jobs created by `user_id` (optionally against one agent) since `since`.
    pub async fn count_jobs_since(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> RuntimeResult<RateWindowCount> {
        let db = self.db.lock().await;
        let (count, oldest): (i64, Option<i64>) = db.query_row(
            "SELECT COUNT(*), MIN(created_at) FROM jobs
             WHERE user_id = ?1 AND (?2 IS NULL OR agent_id = ?2) AND created_at > ?3
               AND schedule_id IS NULL",
            params![user_id, agent_id, to_millis(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(RateWindowCount {
            count: count.max(0) as u64,
            oldest: opt_from_millis(oldest),
        })
    }
}
