//! Resume bookkeeping
//!
//! Per-record stage status lives on the record itself and is written after
//! every transition. The tracker adds the batch-level checkpoint: the last
//! pipeline state a batch reached, which light resume relies on.

use crate::db::checkpoints::{load_checkpoint, save_checkpoint};
use crate::db::Checkpoint;
use crate::models::{PipelineState, Record, RecordStatus};
use bibscout_common::Result;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

#[derive(Clone)]
pub struct ProgressTracker {
    pool: SqlitePool,
    lock_wait_ms: u64,
}

impl ProgressTracker {
    pub fn new(pool: SqlitePool, lock_wait_ms: u64) -> Self {
        Self { pool, lock_wait_ms }
    }

    pub async fn last_checkpoint(&self, batch_key: &str) -> Result<Option<Checkpoint>> {
        load_checkpoint(&self.pool, batch_key).await
    }

    /// Record that `batch_key` reached `state`
    pub async fn checkpoint(&self, batch_key: &str, state: PipelineState, record_count: usize) -> Result<()> {
        save_checkpoint(&self.pool, batch_key, state, record_count, self.lock_wait_ms).await?;
        tracing::debug!(batch_key = %short_key(batch_key), state = %state, "Checkpoint saved");
        Ok(())
    }
}

/// Per-status counts of an in-memory record set
pub fn status_counts(records: &[Record]) -> BTreeMap<RecordStatus, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.status).or_insert(0) += 1;
    }
    counts
}

/// Leading characters of a batch key for log lines
pub fn short_key(batch_key: &str) -> &str {
    batch_key.get(..12).unwrap_or(batch_key)
}
