//! FETCHING_DETAIL stage
//!
//! Only candidates waiting for detail are fetched. Each attempt acquires the
//! detail limiter inside the retry policy; the response is mapped through the
//! field table before the record is finished.

use super::detail_client::{DetailLookup, DetailRequest, DetailSource};
use super::field_mapping::FieldMapper;
use super::rate_limiter::RateLimiter;
use super::retry_policy::{Classify, RetryClass, RetryPolicy};
use super::stage_report::StageReport;
use crate::db::RecordStore;
use crate::error::{EnrichResult, FetchError};
use crate::models::{DetailMap, Record, RecordOutcome};
use bibscout_common::events::{EnrichEvent, EventBus};
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const STAGE_NAME: &str = "FETCHING_DETAIL";

/// Detail fetch stage
pub struct DetailFetcher {
    source: Arc<dyn DetailSource>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    mapper: FieldMapper,
    store: RecordStore,
    event_bus: EventBus,
    stale_after_days: i64,
}

impl DetailFetcher {
    pub fn new(
        source: Arc<dyn DetailSource>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        mapper: FieldMapper,
        store: RecordStore,
        event_bus: EventBus,
        stale_after_days: i64,
    ) -> Self {
        Self {
            source,
            limiter,
            retry,
            mapper,
            store,
            event_bus,
            stale_after_days,
        }
    }

    /// Fetch detail for every record that [`Record::needs_detail`]
    pub async fn fetch_all(
        &self,
        run_id: Uuid,
        records: Vec<Record>,
        cancel: &CancellationToken,
    ) -> EnrichResult<StageReport> {
        let mut report = StageReport::default();
        let pending: Vec<Record> = records.into_iter().filter(Record::needs_detail).collect();
        if pending.is_empty() {
            return Ok(report);
        }

        tracing::info!(
            run_id = %run_id,
            candidates = pending.len(),
            max_concurrency = self.limiter.max_concurrency(),
            "Fetching detail"
        );

        let calls = AtomicU64::new(0);
        let calls_ref = &calls;
        let mut results = stream::iter(pending)
            .map(|record| self.fetch_one(run_id, record, calls_ref, cancel))
            .buffer_unordered(self.limiter.max_concurrency());

        while let Some(result) = results.next().await {
            let (record, outcome, retries) = result?;
            report.retries += retries;
            match outcome {
                Some(outcome) => report.record(record, outcome),
                None => report.cancelled = true,
            }
        }
        drop(results);

        report.calls = calls.load(Ordering::Relaxed);
        report.cancelled |= cancel.is_cancelled();
        Ok(report)
    }

    async fn fetch_one(
        &self,
        run_id: Uuid,
        mut record: Record,
        calls: &AtomicU64,
        cancel: &CancellationToken,
    ) -> EnrichResult<(Record, Option<RecordOutcome>, u64)> {
        if cancel.is_cancelled() {
            return Ok((record, None, 0));
        }

        let request = DetailRequest {
            record_id: record.id.clone(),
            link: record.link.clone(),
            secondary_key: record.secondary_key.clone(),
        };
        let source = &self.source;
        let limiter = &self.limiter;
        let mapper = &self.mapper;
        let request_ref = &request;

        let result = self
            .retry
            .execute(cancel, move |_attempt| async move {
                let _permit = limiter.acquire(cancel).await?;
                calls.fetch_add(1, Ordering::Relaxed);
                match source.fetch(request_ref).await? {
                    DetailLookup::Found(value) => mapper
                        .apply(&value)
                        .map(Some)
                        .ok_or_else(|| FetchError::MalformedResponse("detail response is not an object".into())),
                    DetailLookup::NotFound => Ok::<Option<DetailMap>, FetchError>(None),
                }
            })
            .await;

        let stale_after = Utc::now() + ChronoDuration::days(self.stale_after_days);
        match result {
            Ok(attempted) => {
                let retries = attempted.attempts - 1;
                record.retry_count += retries;
                let outcome = if attempted.value.is_some() {
                    RecordOutcome::Succeeded
                } else {
                    RecordOutcome::NotFound
                };
                record.mark_done(attempted.value, stale_after);
                self.store.upsert_one(&record).await?;

                tracing::debug!(record_id = %record.id, outcome = ?outcome, retries, "Detail fetched");
                self.event_bus.emit_lossy(EnrichEvent::RecordAdvanced {
                    run_id,
                    record_id: record.id.clone(),
                    status: record.status.to_string(),
                    timestamp: Utc::now(),
                });
                Ok((record, Some(outcome), u64::from(retries)))
            }
            Err(failure) if failure.cancelled => Ok((record, None, 0)),
            Err(failure) => {
                let retries = failure.attempts.saturating_sub(1);
                let retryable = matches!(
                    failure.error.retry_class(),
                    RetryClass::Transient | RetryClass::RateLimited
                );
                record.retry_count += retries;
                record.mark_failed(format!("{}: {}", failure.error.kind(), failure.error));
                self.store.upsert_one(&record).await?;

                tracing::warn!(
                    record_id = %record.id,
                    attempts = failure.attempts,
                    error = %failure.error,
                    retryable,
                    "Detail fetch failed"
                );
                self.event_bus.emit_lossy(EnrichEvent::RecordFailed {
                    run_id,
                    record_id: record.id.clone(),
                    stage: STAGE_NAME.to_string(),
                    error: failure.error.to_string(),
                    retryable,
                    timestamp: Utc::now(),
                });

                let outcome = if retryable {
                    RecordOutcome::FailedRetryable
                } else {
                    RecordOutcome::FailedFatal
                };
                Ok((record, Some(outcome), u64::from(retries)))
            }
        }
    }
}
