use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{AgentDescriptor, RequiredCredential};
use super::{Store, from_millis, json_column, to_millis};
use crate::core::error::RuntimeResult;

const AGENT_COLUMNS: &str =
    "agent_id, webhook_url, required_credentials, timeout_secs, active, deactivated_reason, updated_at";

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentDescriptor> {
    let required_credentials: Vec<RequiredCredential> = json_column(row, 2)?;
    Ok(AgentDescriptor {
        agent_id: row.get(0)?,
        webhook_url: row.get(1)?,
        required_credentials,
        timeout_secs: row.get::<_, Option<i64>>(3)?.map(|s| s.max(0) as u64),
        active: row.get(4)?,
        deactivated_reason: row.get(5)?,
        updated_at: from_millis(row.get(6)?),
    })
}

impl Store {
    /// Insert or replace a descriptor. Re-registering an agent reactivates it.
    pub async fn upsert_agent(&self, agent: &AgentDescriptor) -> RuntimeResult<AgentDescriptor> {
        let required = serde_json::to_string(&agent.required_credentials)?;
        let now = to_millis(Utc::now());
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agents (agent_id, webhook_url, required_credentials, timeout_secs, active, deactivated_reason, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(agent_id) DO UPDATE SET
                webhook_url = excluded.webhook_url,
                required_credentials = excluded.required_credentials,
                timeout_secs = excluded.timeout_secs,
                active = excluded.active,
                deactivated_reason = excluded.deactivated_reason,
                updated_at = excluded.updated_at",
            params![
                agent.agent_id,
                agent.webhook_url,
                required,
                agent.timeout_secs.map(|s| s as i64),
                agent.active,
                agent.deactivated_reason,
                now
            ],
        )?;
        let stored = db.query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1"),
            params![agent.agent_id],
            agent_from_row,
        )?;
        Ok(stored)
    }

    pub async fn get_agent(&self, agent_id: &str) -> RuntimeResult<Option<AgentDescriptor>> {
        let db = self.db.lock().await;
        let agent = db
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1"),
                params![agent_id],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    pub async fn list_agents(&self) -> RuntimeResult<Vec<AgentDescriptor>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY agent_id ASC"))?;
        let rows = stmt.query_map([], agent_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Flip an active agent to inactive. Returns false when it was already
    /// inactive or does not exist, so concurrent callers deactivate once.
    pub async fn deactivate_agent(&self, agent_id: &str, reason: &str) -> RuntimeResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agents SET active = 0, deactivated_reason = ?2, updated_at = ?3
             WHERE agent_id = ?1 AND active = 1",
            params![agent_id, reason, to_millis(Utc::now())],
        )?;
        Ok(rows > 0)
    }
}
