//! RESOLVING_LINKS stage
//!
//! Every record below `LINK_ACQUIRED` is searched in the external catalog by a
//! bounded worker pool. Each attempt goes pacer → rate limiter → search, all
//! inside the retry policy. Records are persisted right after their status
//! changes so a crash never loses a completed lookup.

use super::pacer::Pacer;
use super::rate_limiter::RateLimiter;
use super::retry_policy::{Classify, RetryClass, RetryPolicy};
use super::search_client::{CatalogSearch, SearchOutcome, SearchQuery};
use super::stage_report::StageReport;
use crate::db::RecordStore;
use crate::error::{EnrichResult, FetchError};
use crate::models::{Record, RecordOutcome, RecordStatus};
use bibscout_common::events::{EnrichEvent, EventBus};
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const STAGE_NAME: &str = "RESOLVING_LINKS";

/// Link resolution stage for one run
pub struct LinkResolver {
    search: Arc<dyn CatalogSearch>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    pacer: Arc<Pacer>,
    store: RecordStore,
    event_bus: EventBus,
    stale_after_days: i64,
}

/// What one worker produced for one record
struct WorkerResult {
    record: Record,
    outcome: Option<RecordOutcome>,
    retries: u64,
}

impl LinkResolver {
    pub fn new(
        search: Arc<dyn CatalogSearch>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        pacer: Arc<Pacer>,
        store: RecordStore,
        event_bus: EventBus,
        stale_after_days: i64,
    ) -> Self {
        Self {
            search,
            limiter,
            retry,
            pacer,
            store,
            event_bus,
            stale_after_days,
        }
    }

    /// Resolve links for the records still at `NEEDS_LINK`
    ///
    /// Records whose link is already stored advance without a search. Store
    /// failures abort the stage; per-record failures are recorded on the record.
    pub async fn resolve(
        &self,
        run_id: Uuid,
        records: Vec<Record>,
        cancel: &CancellationToken,
    ) -> EnrichResult<StageReport> {
        let mut report = StageReport::default();
        let pending: Vec<Record> = records
            .into_iter()
            .filter(|r| r.status < RecordStatus::LinkAcquired)
            .collect();
        if pending.is_empty() {
            return Ok(report);
        }

        // Link-only classification: a stored link is enough for this stage
        let ids: Vec<String> = pending.iter().map(|r| r.id.clone()).collect();
        let split = self.store.classify_links(&ids).await?;
        let has_link: std::collections::HashSet<String> = split.has_link.into_iter().collect();

        let mut to_search = Vec::with_capacity(split.needs_link.len());
        for mut record in pending {
            if has_link.contains(&record.id) && record.link.is_some() {
                let (score, votes) = (record.coarse_score, record.coarse_votes);
                record.mark_link_acquired(None, score, votes, self.stale_after());
                self.store.upsert_one(&record).await?;
                self.emit_advanced(run_id, &record);
                report.record(record, RecordOutcome::Reused);
            } else {
                to_search.push(record);
            }
        }

        tracing::info!(
            run_id = %run_id,
            reused = report.processed(),
            to_search = to_search.len(),
            max_concurrency = self.limiter.max_concurrency(),
            "Resolving links"
        );

        let calls = AtomicU64::new(0);
        let calls_ref = &calls;
        let mut results = stream::iter(to_search)
            .map(|record| self.resolve_one(run_id, record, calls_ref, cancel))
            .buffer_unordered(self.limiter.max_concurrency());

        while let Some(result) = results.next().await {
            let result = result?;
            report.retries += result.retries;
            match result.outcome {
                Some(outcome) => report.record(result.record, outcome),
                None => report.cancelled = true,
            }
        }
        drop(results);

        report.calls = calls.load(Ordering::Relaxed);
        report.cancelled |= cancel.is_cancelled();
        Ok(report)
    }

    async fn resolve_one(
        &self,
        run_id: Uuid,
        mut record: Record,
        calls: &AtomicU64,
        cancel: &CancellationToken,
    ) -> EnrichResult<WorkerResult> {
        if cancel.is_cancelled() {
            return Ok(WorkerResult {
                record,
                outcome: None,
                retries: 0,
            });
        }

        let key = match record.search_key() {
            Some(key) => key.to_string(),
            None => {
                let error = FetchError::Fatal("record has neither secondary key nor title".into());
                let worker = self.fail(run_id, record, error, 1).await?;
                self.after_record(run_id, cancel).await;
                return Ok(worker);
            }
        };

        let search = &self.search;
        let limiter = &self.limiter;
        let pacer = &self.pacer;
        let record_id = record.id.clone();

        let result = self
            .retry
            .execute(cancel, move |attempt| {
                let query = SearchQuery {
                    record_id: record_id.clone(),
                    key: key.clone(),
                    user_agent: pacer.next_user_agent(),
                };
                async move {
                    pacer.pause_before_attempt(cancel).await?;
                    let _permit = limiter.acquire(cancel).await?;
                    calls.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(record_id = %query.record_id, attempt, "Search attempt");

                    let outcome = search.search(&query).await;
                    if let Err(err) = &outcome {
                        if err.retry_class() == RetryClass::RateLimited {
                            pacer.note_rate_limited();
                        }
                    }
                    outcome
                }
            })
            .await;

        let worker = match result {
            Ok(attempted) => {
                let retries = u64::from(attempted.attempts - 1);
                record.retry_count += attempted.attempts - 1;
                let outcome = match attempted.value {
                    SearchOutcome::Found(hit) => {
                        record.mark_link_acquired(Some(hit.link), hit.score, hit.votes, self.stale_after());
                        RecordOutcome::Succeeded
                    }
                    SearchOutcome::NotFound => {
                        record.mark_link_acquired(None, None, None, self.stale_after());
                        RecordOutcome::NotFound
                    }
                };
                self.store.upsert_one(&record).await?;
                self.emit_advanced(run_id, &record);
                tracing::debug!(
                    record_id = %record.id,
                    outcome = ?outcome,
                    retries,
                    "Link resolved"
                );
                WorkerResult {
                    record,
                    outcome: Some(outcome),
                    retries,
                }
            }
            Err(failure) if failure.cancelled => {
                tracing::debug!(record_id = %record.id, "Link resolution cancelled");
                return Ok(WorkerResult {
                    record,
                    outcome: None,
                    retries: 0,
                });
            }
            Err(failure) => self.fail(run_id, record, failure.error, failure.attempts).await?,
        };

        self.after_record(run_id, cancel).await;
        Ok(worker)
    }

    async fn fail(
        &self,
        run_id: Uuid,
        mut record: Record,
        error: FetchError,
        attempts: u32,
    ) -> EnrichResult<WorkerResult> {
        let retries = attempts.saturating_sub(1);
        let retryable = matches!(
            error.retry_class(),
            RetryClass::Transient | RetryClass::RateLimited
        );

        record.retry_count += retries;
        record.mark_failed(format!("{}: {}", error.kind(), error));
        self.store.upsert_one(&record).await?;

        tracing::warn!(
            record_id = %record.id,
            attempts,
            error = %error,
            retryable,
            "Link resolution failed"
        );
        self.event_bus.emit_lossy(EnrichEvent::RecordFailed {
            run_id,
            record_id: record.id.clone(),
            stage: STAGE_NAME.to_string(),
            error: error.to_string(),
            retryable,
            timestamp: Utc::now(),
        });

        let outcome = if retryable {
            RecordOutcome::FailedRetryable
        } else {
            RecordOutcome::FailedFatal
        };
        Ok(WorkerResult {
            record,
            outcome: Some(outcome),
            retries: u64::from(retries),
        })
    }

    /// Count the record toward the cooldown interval and pause when due
    async fn after_record(&self, run_id: Uuid, cancel: &CancellationToken) {
        if let Some(duration) = self.pacer.record_processed() {
            self.event_bus.emit_lossy(EnrichEvent::CooldownStarted {
                run_id,
                processed: self.pacer.processed(),
                duration_ms: duration.as_millis() as u64,
                timestamp: Utc::now(),
            });
            if self.pacer.cooldown(duration, cancel).await.is_err() {
                tracing::debug!("Cooldown interrupted by cancellation");
            }
        }
    }

    fn emit_advanced(&self, run_id: Uuid, record: &Record) {
        self.event_bus.emit_lossy(EnrichEvent::RecordAdvanced {
            run_id,
            record_id: record.id.clone(),
            status: record.status.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn stale_after(&self) -> chrono::DateTime<Utc> {
        Utc::now() + ChronoDuration::days(self.stale_after_days)
    }
}
