use chrono::Utc;
use rusqlite::params;

use super::types::{WorkerPhase, WorkerRecord};
use super::{Store, from_millis, opt_json_column, to_millis};
use crate::core::error::RuntimeResult;

impl Store {
    pub async fn register_worker(
        &self,
        worker_id: &str,
        capacity: usize,
        capabilities: Option<&[String]>,
    ) -> RuntimeResult<()> {
        let capabilities = match capabilities {
            Some(caps) => Some(serde_json::to_string(caps)?),
            None => None,
        };
        let now = to_millis(Utc::now());
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO workers (worker_id, status, phase, active_jobs, capacity, capabilities, last_heartbeat, started_at)
             VALUES (?1, 'online', 'idle', 0, ?2, ?3, ?4, ?4)
             ON CONFLICT(worker_id) DO UPDATE SET
                status = 'online', phase = 'idle', active_jobs = 0,
                capacity = excluded.capacity, capabilities = excluded.capabilities,
                last_heartbeat = excluded.last_heartbeat, started_at = excluded.started_at",
            params![worker_id, capacity as i64, capabilities, now],
        )?;
        Ok(())
    }

    /// Persist a heartbeat. Returns false if the worker row is gone.
    pub async fn record_heartbeat(
        &self,
        worker_id: &str,
        active_jobs: usize,
        phase: WorkerPhase,
    ) -> RuntimeResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE workers SET last_heartbeat = ?2, active_jobs = ?3, phase = ?4, status = 'online'
             WHERE worker_id = ?1",
            params![worker_id, to_millis(Utc::now()), active_jobs as i64, phase],
        )?;
        Ok(rows > 0)
    }

    pub async fn mark_worker_offline(&self, worker_id: &str) -> RuntimeResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE workers SET status = 'offline', phase = 'stopped', active_jobs = 0 WHERE worker_id = ?1",
            params![worker_id],
        )?;
        Ok(())
    }

    pub async fn list_workers(&self) -> RuntimeResult<Vec<WorkerRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT worker_id, status, phase, active_jobs, capacity, capabilities, last_heartbeat, started_at
             FROM workers ORDER BY worker_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WorkerRecord {
                worker_id: row.get(0)?,
                status: row.get(1)?,
                phase: row.get(2)?,
                active_jobs: row.get(3)?,
                capacity: row.get(4)?,
                capabilities: opt_json_column(row, 5)?,
                last_heartbeat: from_millis(row.get(6)?),
                started_at: from_millis(row.get(7)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::super::types::WorkerStatus;
    use super::*;

    #[tokio::test]
    async fn register_heartbeat_and_stop() {
        let store = test_store();
        let caps = vec!["openai".to_string()];
        store.register_worker("w1", 4, Some(&caps)).await.unwrap();
        assert!(
            store
                .record_heartbeat("w1", 2, WorkerPhase::Dispatching)
                .await
                .unwrap()
        );

        let workers = store.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].active_jobs, 2);
        assert_eq!(workers[0].phase, WorkerPhase::Dispatching);
        assert_eq!(workers[0].capabilities, Some(caps));

        store.mark_worker_offline("w1").await.unwrap();
        let workers = store.list_workers().await.unwrap();
        assert_eq!(workers[0].status, WorkerStatus::Offline);
        assert_eq!(workers[0].phase, WorkerPhase::Stopped);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_worker_is_false() {
        let store = test_store();
        assert!(
            !store
                .record_heartbeat("ghost", 0, WorkerPhase::Idle)
                .await
                .unwrap()
        );
    }
}
