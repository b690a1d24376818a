//! Record persistence
//!
//! `upsert` is the only mutator. Each record is written by a single
//! `INSERT .. ON CONFLICT` statement, so a crash never leaves one record with a
//! mix of old and new fields.

use crate::models::{DetailMap, Record, RecordStatus};
use crate::utils::retry_on_lock;
use bibscout_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashMap, HashSet};

/// SQLite caps bound parameters per statement; stay well below it
const LOOKUP_CHUNK: usize = 400;

const RECORD_COLUMNS: &str = "id, secondary_key, title, classification, link, coarse_score, \
     coarse_votes, detail, status, is_candidate, stale_after, last_error, retry_count";

/// Full classification of requested ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// DONE and not stale: reusable as-is
    pub valid: Vec<String>,
    /// DONE but past `stale_after`: needs re-resolution
    pub stale: Vec<String>,
    /// Absent or not yet DONE
    pub new: Vec<String>,
}

/// Link-only classification used by the link stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkClassification {
    /// Stored record already carries a link
    pub has_link: Vec<String>,
    pub needs_link: Vec<String>,
}

/// Classify ids by the full freshness rule (input order preserved)
pub fn classify_full(
    ids: &[String],
    stored: &HashMap<String, Record>,
    now: DateTime<Utc>,
) -> Classification {
    let mut out = Classification::default();
    for id in ids {
        match stored.get(id) {
            Some(r) if r.status == RecordStatus::Done && r.is_stale(now) => out.stale.push(id.clone()),
            Some(r) if r.status == RecordStatus::Done => out.valid.push(id.clone()),
            _ => out.new.push(id.clone()),
        }
    }
    out
}

/// Classify ids by link presence only (input order preserved)
pub fn classify_links(ids: &[String], with_link: &HashSet<String>) -> LinkClassification {
    let mut out = LinkClassification::default();
    for id in ids {
        if with_link.contains(id) {
            out.has_link.push(id.clone());
        } else {
            out.needs_link.push(id.clone());
        }
    }
    out
}

/// Persistent record store backed by SQLite
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
    lock_wait_ms: u64,
    category_prefix_len: usize,
}

impl RecordStore {
    pub fn new(pool: SqlitePool, lock_wait_ms: u64, category_prefix_len: usize) -> Self {
        Self {
            pool,
            lock_wait_ms,
            category_prefix_len,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Load stored records for `ids`; absent ids are simply missing from the map
    pub async fn lookup(&self, ids: &[String]) -> Result<HashMap<String, Record>> {
        let mut found = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {} FROM records WHERE id IN (", RECORD_COLUMNS));
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");

            let rows = query.build().fetch_all(&self.pool).await?;
            for row in rows {
                let record = record_from_row(&row)?;
                found.insert(record.id.clone(), record);
            }
        }

        Ok(found)
    }

    /// Write records, one atomic statement per record
    pub async fn upsert(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            prepared.push(PreparedRecord::new(record, self.category_prefix_len)?);
        }
        let prepared = &prepared;
        let pool = &self.pool;

        retry_on_lock("upsert_records", self.lock_wait_ms, || async move {
            let mut tx = pool.begin().await?;
            for record in prepared {
                write_record(&mut tx, record).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::debug!(count = records.len(), "Records upserted");
        Ok(())
    }

    pub async fn upsert_one(&self, record: &Record) -> Result<()> {
        self.upsert(std::slice::from_ref(record)).await
    }

    /// Full classification (status + staleness)
    pub async fn classify_full(&self, ids: &[String], now: DateTime<Utc>) -> Result<Classification> {
        let stored = self.lookup(ids).await?;
        Ok(classify_full(ids, &stored, now))
    }

    /// Link-only classification (presence of a stored link)
    pub async fn classify_links(&self, ids: &[String]) -> Result<LinkClassification> {
        let mut with_link = HashSet::new();

        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id FROM records WHERE link IS NOT NULL AND link != '' AND id IN (",
            );
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");

            let rows = query.build().fetch_all(&self.pool).await?;
            for row in rows {
                with_link.insert(row.get::<String, _>("id"));
            }
        }

        Ok(classify_links(ids, &with_link))
    }

    /// Total number of stored records
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Stored record counts per status
    pub async fn count_by_status(&self) -> Result<BTreeMap<RecordStatus, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM records GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.get("status");
            counts.insert(status.parse::<RecordStatus>()?, row.get::<i64, _>("n"));
        }
        Ok(counts)
    }
}

/// Record fields converted to bindable column values
struct PreparedRecord<'a> {
    record: &'a Record,
    category: String,
    detail: Option<String>,
    stale_after: Option<String>,
}

impl<'a> PreparedRecord<'a> {
    fn new(record: &'a Record, prefix_len: usize) -> Result<Self> {
        let detail = record
            .detail
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Internal(format!("Failed to serialize detail for {}: {}", record.id, e)))?;

        Ok(Self {
            record,
            category: record.category(prefix_len),
            detail,
            stale_after: record.stale_after.map(|dt| dt.to_rfc3339()),
        })
    }
}

async fn write_record(conn: &mut SqliteConnection, prepared: &PreparedRecord<'_>) -> Result<()> {
    let record = prepared.record;
    sqlx::query(
        r#"
        INSERT INTO records (
            id, secondary_key, title, classification, category, link,
            coarse_score, coarse_votes, detail, status, is_candidate,
            stale_after, last_error, retry_count, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
        ON CONFLICT(id) DO UPDATE SET
            secondary_key = excluded.secondary_key,
            title = excluded.title,
            classification = excluded.classification,
            category = excluded.category,
            link = excluded.link,
            coarse_score = excluded.coarse_score,
            coarse_votes = excluded.coarse_votes,
            detail = excluded.detail,
            status = excluded.status,
            is_candidate = excluded.is_candidate,
            stale_after = excluded.stale_after,
            last_error = excluded.last_error,
            retry_count = excluded.retry_count,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&record.id)
    .bind(&record.secondary_key)
    .bind(&record.title)
    .bind(&record.classification)
    .bind(&prepared.category)
    .bind(&record.link)
    .bind(record.coarse_score)
    .bind(record.coarse_votes)
    .bind(&prepared.detail)
    .bind(record.status.as_str())
    .bind(record.is_candidate)
    .bind(&prepared.stale_after)
    .bind(&record.last_error)
    .bind(record.retry_count as i64)
    .execute(conn)
    .await?;

    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let status: String = row.get("status");
    let detail: Option<String> = row.get("detail");
    let stale_after: Option<String> = row.get("stale_after");
    let retry_count: i64 = row.get("retry_count");
    let id: String = row.get("id");

    let detail = detail
        .map(|json| serde_json::from_str::<DetailMap>(&json))
        .transpose()
        .map_err(|e| Error::Internal(format!("Corrupt detail JSON for {}: {}", id, e)))?;

    let stale_after = stale_after
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| Error::Internal(format!("Corrupt stale_after for {}: {}", id, e)))?;

    let status = status
        .parse::<RecordStatus>()
        .map_err(|e| Error::Internal(format!("Corrupt status for {}: {}", id, e)))?;

    Ok(Record {
        id,
        secondary_key: row.get("secondary_key"),
        title: row.get("title"),
        classification: row.get("classification"),
        link: row.get("link"),
        coarse_score: row.get("coarse_score"),
        coarse_votes: row.get("coarse_votes"),
        detail,
        status,
        is_candidate: row.get("is_candidate"),
        stale_after,
        last_error: row.get("last_error"),
        retry_count: retry_count.max(0) as u32,
    })
}
