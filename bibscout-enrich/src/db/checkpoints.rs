//! Batch checkpoint persistence

use crate::models::PipelineState;
use crate::utils::retry_on_lock;
use bibscout_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// Last completed pipeline stage for one batch
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub batch_key: String,
    pub state: PipelineState,
    pub record_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Save (insert or replace) the checkpoint for a batch
pub async fn save_checkpoint(
    pool: &SqlitePool,
    batch_key: &str,
    state: PipelineState,
    record_count: usize,
    max_wait_ms: u64,
) -> Result<()> {
    let updated_at = Utc::now().to_rfc3339();
    let record_count = record_count as i64;

    retry_on_lock("save_checkpoint", max_wait_ms, || {
        let updated_at = &updated_at;
        async move {
            sqlx::query(
                r#"
                INSERT INTO run_checkpoints (batch_key, state, record_count, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(batch_key) DO UPDATE SET
                    state = excluded.state,
                    record_count = excluded.record_count,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(batch_key)
            .bind(state.as_str())
            .bind(record_count)
            .bind(updated_at)
            .execute(pool)
            .await?;
            Ok(())
        }
    })
    .await
}

/// Load the checkpoint for a batch, if any
pub async fn load_checkpoint(pool: &SqlitePool, batch_key: &str) -> Result<Option<Checkpoint>> {
    let row = sqlx::query(
        "SELECT batch_key, state, record_count, updated_at FROM run_checkpoints WHERE batch_key = ?",
    )
    .bind(batch_key)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let state: String = row.get("state");
            let updated_at: String = row.get("updated_at");
            let record_count: i64 = row.get("record_count");

            Ok(Some(Checkpoint {
                batch_key: row.get("batch_key"),
                state: state.parse()?,
                record_count: record_count.max(0) as usize,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(|e| Error::Internal(format!("Failed to parse updated_at: {}", e)))?
                    .with_timezone(&Utc),
            }))
        }
        None => Ok(None),
    }
}
