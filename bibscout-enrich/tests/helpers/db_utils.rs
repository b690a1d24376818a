//! Database Test Utilities
//!
//! Temp-file databases, seeding, and schema inspection

use anyhow::Result;
use bibscout_enrich::db::RecordStore;
use bibscout_enrich::models::{InputItem, Record, RecordStatus};
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Column information from PRAGMA table_info
#[derive(Debug, sqlx::FromRow)]
pub struct ColumnInfo {
    pub cid: i32,
    pub name: String,
    pub r#type: String,
    pub notnull: i32,
    pub dflt_value: Option<String>,
    pub pk: i32,
}

/// Create temporary test database with the schema applied
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test_bibscout.db");
    let pool = bibscout_enrich::db::init_database_pool(&db_path).await?;
    Ok((temp_dir, pool))
}

/// Get table schema information
pub async fn get_table_columns(pool: &SqlitePool, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let query = format!("PRAGMA table_info({})", table_name);
    let columns = sqlx::query_as::<_, ColumnInfo>(&query)
        .fetch_all(pool)
        .await?;
    Ok(columns)
}

/// Check if table has specific column
pub async fn has_column(pool: &SqlitePool, table_name: &str, column_name: &str) -> Result<bool> {
    let columns = get_table_columns(pool, table_name).await?;
    Ok(columns.iter().any(|c| c.name == column_name))
}

/// Store handle matching the test configuration
pub fn test_store(pool: &SqlitePool) -> RecordStore {
    RecordStore::new(pool.clone(), 1_000, 1)
}

/// A finished, fresh record with coarse signals
pub fn done_record(id: &str, classification: &str, score: f64, votes: i64) -> Record {
    let mut record = Record::new(
        &InputItem::new(id, Some(format!("isbn-{}", id))).with_classification(classification),
    );
    record.link = Some(format!("https://catalog.test/subject/{}", id));
    record.coarse_score = Some(score);
    record.coarse_votes = Some(votes);
    record.status = RecordStatus::Done;
    record.stale_after = Some(Utc::now() + Duration::days(30));
    record
}

/// Write records straight to the store
pub async fn seed_records(pool: &SqlitePool, records: &[Record]) -> Result<()> {
    test_store(pool).upsert(records).await?;
    Ok(())
}

/// Read one stored record, panicking when absent
pub async fn stored(pool: &SqlitePool, id: &str) -> Record {
    let found = test_store(pool)
        .lookup(&[id.to_string()])
        .await
        .expect("lookup failed");
    found
        .get(id)
        .cloned()
        .unwrap_or_else(|| panic!("record {} not stored", id))
}
