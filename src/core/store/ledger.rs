use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use super::types::{LedgerEntry, Phase};
use super::{Store, from_millis, json_column, to_millis};
use crate::core::error::RuntimeResult;

/// Append one phase row on an open connection or transaction.
pub(super) fn insert_phase(
    conn: &Connection,
    job_id: &str,
    phase: Phase,
    at: DateTime<Utc>,
    duration_ms: Option<u64>,
    data: &serde_json::Value,
) -> RuntimeResult<()> {
    conn.execute(
        "INSERT INTO ledger (job_id, phase, recorded_at, duration_ms, data) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            job_id,
            phase,
            to_millis(at),
            duration_ms.map(|d| d as i64),
            serde_json::to_string(data)?
        ],
    )?;
    Ok(())
}

impl Store {
    pub async fn append_phase(
        &self,
        job_id: &str,
        phase: Phase,
        duration_ms: Option<u64>,
        data: serde_json::Value,
    ) -> RuntimeResult<()> {
        let db = self.db.lock().await;
        insert_phase(&db, job_id, phase, Utc::now(), duration_ms, &data)
    }

    /// Phase history in append order.
    pub async fn list_phases(&self, job_id: &str) -> RuntimeResult<Vec<LedgerEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, job_id, phase, recorded_at, duration_ms, data
             FROM ledger WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok(LedgerEntry {
                id: row.get(0)?,
                job_id: row.get(1)?,
                phase: row.get(2)?,
                recorded_at: from_millis(row.get(3)?),
                duration_ms: row.get::<_, Option<i64>>(4)?.map(|d| d.max(0) as u64),
                data: json_column(row, 5)?,
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
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn phases_come_back_in_append_order() {
        let store = test_store();
        store
            .append_phase("job-1", Phase::Queued, None, json!({}))
            .await
            .unwrap();
        store
            .append_phase("job-1", Phase::Running, None, json!({"worker_id": "w1"}))
            .await
            .unwrap();
        store
            .append_phase("job-2", Phase::Queued, None, json!({}))
            .await
            .unwrap();
        store
            .append_phase("job-1", Phase::Completed, Some(42), json!({"status_code": 200}))
            .await
            .unwrap();

        let phases = store.list_phases("job-1").await.unwrap();
        let names: Vec<Phase> = phases.iter().map(|p| p.phase).collect();
        assert_eq!(names, vec![Phase::Queued, Phase::Running, Phase::Completed]);
        assert_eq!(phases[2].duration_ms, Some(42));
        assert_eq!(phases[1].data["worker_id"], "w1");
    }
}
