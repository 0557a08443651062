use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use super::jobs::insert_job;
use super::types::{JobRecord, NewJob, ScheduleRecord};
use super::{Store, from_millis, json_column, opt_from_millis, to_millis};
use crate::core::error::RuntimeResult;

const SCHEDULE_COLUMNS: &str = "schedule_id, agent_id, user_id, cron_expression, timezone, payload, \
     priority, max_retries, active, next_run, last_run, created_at, updated_at";

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        schedule_id: row.get(0)?,
        agent_id: row.get(1)?,
        user_id: row.get(2)?,
        cron_expression: row.get(3)?,
        timezone: row.get(4)?,
        payload: json_column(row, 5)?,
        priority: row.get(6)?,
        max_retries: row.get(7)?,
        active: row.get(8)?,
        next_run: from_millis(row.get(9)?),
        last_run: opt_from_millis(row.get(10)?),
        created_at: from_millis(row.get(11)?),
        updated_at: from_millis(row.get(12)?),
    })
}

/// Result of trying to fire one due schedule occurrence.
#[derive(Debug)]
pub enum Promotion {
    Enqueued(JobRecord),
    /// `next_run` moved forward without creating a job.
    Skipped,
    /// Another poller already advanced this occurrence.
    Raced,
}

impl Store {
    pub async fn upsert_schedule(&self, schedule: &ScheduleRecord) -> RuntimeResult<ScheduleRecord> {
        let now = to_millis(Utc::now());
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO schedules (schedule_id, agent_id, user_id, cron_expression, timezone, payload,
                                    priority, max_retries, active, next_run, last_run, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?11)
             ON CONFLICT(schedule_id) DO UPDATE SET
                agent_id = excluded.agent_id,
                user_id = excluded.user_id,
                cron_expression = excluded.cron_expression,
                timezone = excluded.timezone,
                payload = excluded.payload,
                priority = excluded.priority,
                max_retries = excluded.max_retries,
                active = excluded.active,
                next_run = excluded.next_run,
                updated_at = excluded.updated_at",
            params![
                schedule.schedule_id,
                schedule.agent_id,
                schedule.user_id,
                schedule.cron_expression,
                schedule.timezone,
                serde_json::to_string(&schedule.payload)?,
                schedule.priority,
                schedule.max_retries,
                schedule.active,
                to_millis(schedule.next_run),
                now
            ],
        )?;
        let stored = db.query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE schedule_id = ?1"),
            params![schedule.schedule_id],
            schedule_from_row,
        )?;
        Ok(stored)
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> RuntimeResult<Option<ScheduleRecord>> {
        let db = self.db.lock().await;
        let schedule = db
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE schedule_id = ?1"),
                params![schedule_id],
                schedule_from_row,
            )
            .optional()?;
        Ok(schedule)
    }

    pub async fn list_schedules(&self) -> RuntimeResult<Vec<ScheduleRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY next_run ASC"
        ))?;
        let rows = stmt.query_map([], schedule_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn remove_schedule(&self, schedule_id: &str) -> RuntimeResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM schedules WHERE schedule_id = ?1",
            params![schedule_id],
        )?;
        Ok(rows > 0)
    }

    pub async fn due_schedules(&self, now: DateTime<Utc>) -> RuntimeResult<Vec<ScheduleRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE active = 1 AND next_run <= ?1 ORDER BY next_run ASC"
        ))?;
        let rows = stmt.query_map(params![to_millis(now)], schedule_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Advance `schedule` from the `next_run` it was read with to
    /// `following_run` and, when `enqueue` is set, insert the occurrence's job
    /// in the same transaction.
    pub async fn promote_schedule(
        &self,
        schedule: &ScheduleRecord,
        following_run: DateTime<Utc>,
        enqueue: bool,
    ) -> RuntimeResult<Promotion> {
        let now = Utc::now();
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let advanced = tx.execute(
            "UPDATE schedules SET next_run = ?3, last_run = ?4, updated_at = ?4
             WHERE schedule_id = ?1 AND next_run = ?2 AND active = 1",
            params![
                schedule.schedule_id,
                to_millis(schedule.next_run),
                to_millis(following_run),
                to_millis(now)
            ],
        )?;
        if advanced == 0 {
            return Ok(Promotion::Raced);
        }
        if !enqueue {
            tx.commit()?;
            return Ok(Promotion::Skipped);
        }

        let job = insert_job(
            &tx,
            &NewJob {
                agent_id: schedule.agent_id.clone(),
                user_id: schedule.user_id.clone(),
                payload: schedule.payload.clone(),
                priority: schedule.priority,
                scheduled_at: None,
                max_retries: i64::from(schedule.max_retries),
                schedule_id: Some(schedule.schedule_id.clone()),
            },
            now,
        )?;
        tx.commit()?;
        Ok(Promotion::Enqueued(job))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::super::types::JobStatus;
    use super::*;
    use serde_json::json;

    fn schedule(id: &str, next_run: DateTime<Utc>) -> ScheduleRecord {
        let now = Utc::now();
        ScheduleRecord {
            schedule_id: id.to_string(),
            agent_id: "reporter".to_string(),
            user_id: "user-1".to_string(),
            cron_expression: "0 9 * * *".to_string(),
            timezone: "Europe/Berlin".to_string(),
            payload: json!({ "report": "daily" }),
            priority: 2,
            max_retries: 1,
            active: true,
            next_run,
            last_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn due_schedules_only_returns_past_active_rows() {
        let store = test_store();
        let now = Utc::now();
        store
            .upsert_schedule(&schedule("past", now - chrono::Duration::minutes(1)))
            .await
            .unwrap();
        store
            .upsert_schedule(&schedule("future", now + chrono::Duration::minutes(5)))
            .await
            .unwrap();
        let mut paused = schedule("paused", now - chrono::Duration::minutes(1));
        paused.active = false;
        store.upsert_schedule(&paused).await.unwrap();

        let due = store.due_schedules(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].schedule_id, "past");
    }

    #[tokio::test]
    async fn promotion_enqueues_once_per_occurrence() {
        let store = test_store();
        let now = Utc::now();
        let sched = store
            .upsert_schedule(&schedule("daily", now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let next = now + chrono::Duration::days(1);

        let first = store.promote_schedule(&sched, next, true).await.unwrap();
        let Promotion::Enqueued(job) = first else {
            panic!("expected a job, got {:?}", first);
        };
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.schedule_id.as_deref(), Some("daily"));
        assert_eq!(job.payload, json!({ "report": "daily" }));

        // Same stale snapshot from a second poller.
        let second = store.promote_schedule(&sched, next, true).await.unwrap();
        assert!(matches!(second, Promotion::Raced));
        assert_eq!(store.list_jobs(10).await.unwrap().len(), 1);

        let stored = store.get_schedule("daily").await.unwrap().unwrap();
        assert_eq!(to_millis(stored.next_run), to_millis(next));
        assert!(stored.last_run.is_some());
    }

    #[tokio::test]
    async fn skipped_promotion_advances_without_a_job() {
        let store = test_store();
        let now = Utc::now();
        let sched = store
            .upsert_schedule(&schedule("s", now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let result = store
            .promote_schedule(&sched, now + chrono::Duration::hours(1), false)
            .await
            .unwrap();
        assert!(matches!(result, Promotion::Skipped));
        assert!(store.list_jobs(10).await.unwrap().is_empty());
        assert!(store.due_schedules(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_schedule() {
        let store = test_store();
        store
            .upsert_schedule(&schedule("gone", Utc::now()))
            .await
            .unwrap();
        assert!(store.remove_schedule("gone").await.unwrap());
        assert!(store.get_schedule("gone").await.unwrap().is_none());
    }
}
