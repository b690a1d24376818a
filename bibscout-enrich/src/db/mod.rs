//! Database access for bibscout-enrich
//!
//! The `records` table is the persistent store; `run_checkpoints` backs
//! resumable runs.

pub mod checkpoints;
pub mod records;

pub use checkpoints::Checkpoint;
pub use records::{Classification, LinkClassification, RecordStore};

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Creates the file and schema on first run.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    tracing::debug!("Connecting to database: {}", db_path.display());
    let pool = bibscout_common::db::init_database(db_path).await?;
    Ok(pool)
}

/// Single-connection in-memory pool with the schema applied
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    bibscout_common::db::init_schema(&pool).await.unwrap();
    pool
}
