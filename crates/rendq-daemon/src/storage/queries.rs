//! Database queries for the rendq daemon.

use serde::Serialize;
use serde::de::DeserializeOwned;

use rendq_core::db::unix_timestamp_millis;

use super::db::{Database, DatabaseError};
use super::models::HistoryRecord;

impl Database {
    // =========================================================================
    // Key-value store
    // =========================================================================

    /// Read the raw value stored under `key`.
    pub async fn kv_get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(value.map(|(v,)| v))
    }

    /// Store a raw value under `key`, replacing any previous value.
    pub async fn kv_set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            ",
        )
        .bind(key)
        .bind(value)
        .bind(unix_timestamp_millis())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Read and decode the JSON value under `key`, or `default` when absent.
    pub async fn kv_get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, DatabaseError> {
        match self.kv_get(key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(default),
        }
    }

    /// Encode `value` as JSON and store it under `key`.
    pub async fn kv_set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), DatabaseError> {
        let raw = serde_json::to_string(value)?;
        self.kv_set(key, &raw).await
    }

    // =========================================================================
    // Render history
    // =========================================================================

    /// Insert a history record.
    pub async fn insert_history(&self, record: &HistoryRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO render_history (
                id, job_id, name, command, status, start_time, end_time, duration_ms,
                progress, current_frame, total_frames, current_sample, total_samples,
                peak_memory, error, parameters
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&record.id)
        .bind(&record.job_id)
        .bind(&record.name)
        .bind(&record.command)
        .bind(&record.status)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.duration_ms)
        .bind(record.progress)
        .bind(record.current_frame)
        .bind(record.total_frames)
        .bind(record.current_sample)
        .bind(record.total_samples)
        .bind(record.peak_memory)
        .bind(&record.error)
        .bind(&record.parameters)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get a history record by ID.
    pub async fn get_history(&self, id: &str) -> Result<HistoryRecord, DatabaseError> {
        sqlx::query_as::<_, HistoryRecord>("SELECT * FROM render_history WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("History record {id}")))
    }

    /// List history records, newest first.
    pub async fn list_history(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<HistoryRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, HistoryRecord>(
            "SELECT * FROM render_history ORDER BY end_time DESC, rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    /// List history records of one job, newest first.
    pub async fn list_job_history(&self, job_id: &str) -> Result<Vec<HistoryRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, HistoryRecord>(
            "SELECT * FROM render_history WHERE job_id = ? ORDER BY end_time DESC, rowid DESC",
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    /// Keep only the newest `keep` records. Returns how many were removed.
    pub async fn prune_history(&self, keep: u32) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r"
            DELETE FROM render_history WHERE id NOT IN (
                SELECT id FROM render_history ORDER BY end_time DESC, rowid DESC LIMIT ?
            )
            ",
        )
        .bind(keep)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete one history record. Returns whether it existed.
    pub async fn delete_history(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM render_history WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete all history records.
    pub async fn clear_history(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM render_history")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
