use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::types::{CredentialRecord, CredentialStatus, CredentialSummary};
use super::{Store, from_millis, to_millis};
use crate::core::error::RuntimeResult;

impl Store {
    pub async fn put_credential(
        &self,
        user_id: &str,
        provider: &str,
        encrypted_blob: &str,
    ) -> RuntimeResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO credentials (user_id, provider, encrypted_blob, status, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4)
             ON CONFLICT(user_id, provider) DO UPDATE SET
                encrypted_blob = excluded.encrypted_blob,
                status = 'active',
                updated_at = excluded.updated_at",
            params![user_id, provider, encrypted_blob, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn get_credential(
        &self,
        user_id: &str,
        provider: &str,
    ) -> RuntimeResult<Option<CredentialRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT user_id, provider, encrypted_blob, status, updated_at
                 FROM credentials WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
                |row| {
                    Ok(CredentialRecord {
                        user_id: row.get(0)?,
                        provider: row.get(1)?,
                        encrypted_blob: row.get(2)?,
                        status: row.get(3)?,
                        updated_at: from_millis(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Providers for which the user holds an active credential.
    pub async fn active_providers(&self, user_id: &str) -> RuntimeResult<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT provider FROM credentials WHERE user_id = ?1 AND status = 'active' ORDER BY provider",
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn list_credentials(&self, user_id: &str) -> RuntimeResult<Vec<CredentialSummary>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT provider, status, updated_at FROM credentials WHERE user_id = ?1 ORDER BY provider",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(CredentialSummary {
                provider: row.get(0)?,
                status: row.get(1)?,
                updated_at: from_millis(row.get(2)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub async fn set_credential_status(
        &self,
        user_id: &str,
        provider: &str,
        status: CredentialStatus,
    ) -> RuntimeResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE credentials SET status = ?3, updated_at = ?4 WHERE user_id = ?1 AND provider = ?2",
            params![user_id, provider, status, to_millis(Utc::now())],
        )?;
        Ok(rows > 0)
    }

    pub async fn remove_credential(&self, user_id: &str, provider: &str) -> RuntimeResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM credentials WHERE user_id = ?1 AND provider = ?2",
            params![user_id, provider],
        )?;
        Ok(rows > 0)
    }
}
