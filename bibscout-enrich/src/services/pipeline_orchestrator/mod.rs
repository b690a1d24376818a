//! Enrichment pipeline orchestrator
//!
//! # State Progression
//! LOADING → DEDUP → RESOLVING_LINKS → FILTERING → FETCHING_DETAIL → PERSISTING → DONE
//!
//! Terminal states besides DONE: ERROR (store or configuration failure),
//! CANCELLED (cancellation token fired) and PAUSED (continuation policy said
//! pause after FILTERING).
//!
//! Each state is handled by a `phase_*` method in its own module. The
//! RESOLVING_LINKS → FILTERING step is a hard barrier: filtering needs every
//! coarse signal of the batch.

use crate::db::{Checkpoint, RecordStore};
use crate::error::{EnrichError, EnrichResult};
use crate::models::{Batch, InputItem, PipelineState, Record, RecordOutcome, RunOptions, RunSession, RunSummary};
use crate::services::continuation::{AlwaysContinue, ContinuationPolicy};
use crate::services::detail_client::{DetailSource, HttpDetailSource};
use crate::services::field_mapping::FieldMapper;
use crate::services::progress_tracker::{short_key, ProgressTracker};
use crate::services::rate_limiter::RateLimiter;
use crate::services::retry_policy::RetryPolicy;
use crate::services::search_client::{CatalogSearch, HttpCatalogSearch};
use crate::services::stage_report::StageReport;
use crate::services::threshold_filter::CategoryThreshold;
use bibscout_common::config::PipelineConfig;
use bibscout_common::events::{EnrichEvent, EventBus};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod phase_dedup;
mod phase_fetching;
mod phase_filtering;
mod phase_loading;
mod phase_persisting;
mod phase_resolving;

/// How a phase ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseFlow {
    Continue,
    /// Stop the run in the given terminal state
    Stop(PipelineState),
}

/// Mutable state of one run
struct RunContext {
    session: RunSession,
    batch: Batch,
    options: RunOptions,
    /// Batch records in input order
    records: Vec<Record>,
    index: HashMap<String, usize>,
    /// Stored copies as found at LOADING
    stored: HashMap<String, Record>,
    /// Batch checkpoint left by an earlier run, read before this run writes one
    previous_checkpoint: Option<Checkpoint>,
    /// Ids changed in memory this run and not yet written
    dirty: BTreeSet<String>,
    outcomes: BTreeMap<String, RecordOutcome>,
    thresholds: Vec<CategoryThreshold>,
    retries: u64,
    search_calls: u64,
    detail_calls: u64,
    cancel: CancellationToken,
}

impl RunContext {
    fn run_id(&self) -> uuid::Uuid {
        self.session.run_id
    }

    fn writes_enabled(&self) -> bool {
        !self.options.dry_run
    }

    fn records_where(&self, pred: impl Fn(&Record) -> bool) -> Vec<Record> {
        self.records.iter().filter(|r| pred(r)).cloned().collect()
    }

    /// Fold a stage's results back into the batch
    ///
    /// Stage workers persist each record themselves, so merged records are
    /// already clean.
    fn merge(&mut self, report: StageReport) {
        for record in report.updated {
            if let Some(&i) = self.index.get(&record.id) {
                self.dirty.remove(&record.id);
                self.records[i] = record;
            }
        }
        self.outcomes.extend(report.outcomes);
        self.retries += report.retries;
    }

    fn mark_dirty(&mut self, id: &str) {
        self.dirty.insert(id.to_string());
    }
}

/// Pipeline orchestrator service
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    store: RecordStore,
    progress: ProgressTracker,
    search: Arc<dyn CatalogSearch>,
    detail: Arc<dyn DetailSource>,
    link_limiter: Arc<RateLimiter>,
    detail_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    mapper: FieldMapper,
    event_bus: EventBus,
    continuation: Arc<dyn ContinuationPolicy>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator with explicit search and detail backends
    ///
    /// The configuration and field-mapping table are validated here, before
    /// any run starts.
    pub fn new(
        db: SqlitePool,
        config: PipelineConfig,
        search: Arc<dyn CatalogSearch>,
        detail: Arc<dyn DetailSource>,
        event_bus: EventBus,
    ) -> EnrichResult<Self> {
        config.validate()?;
        let mapper = FieldMapper::new(config.detail.field_mappings.clone())?;

        Ok(Self {
            store: RecordStore::new(db.clone(), config.retry.lock_wait_ms, config.filter.category_prefix_len),
            progress: ProgressTracker::new(db, config.retry.lock_wait_ms),
            link_limiter: Arc::new(RateLimiter::from_config("link", &config.link_stage)),
            detail_limiter: Arc::new(RateLimiter::from_config("detail", &config.detail_stage)),
            retry: RetryPolicy::new(config.retry.clone()),
            search,
            detail,
            mapper,
            event_bus,
            continuation: Arc::new(AlwaysContinue),
            config,
        })
    }

    /// Create an orchestrator talking to the configured HTTP services
    pub fn from_config(db: SqlitePool, config: PipelineConfig, event_bus: EventBus) -> EnrichResult<Self> {
        let search = HttpCatalogSearch::new(&config.search)
            .map_err(|e| EnrichError::Config(e.to_string()))?;
        let detail = HttpDetailSource::new(&config.detail, config.resolve_detail_api_key())
            .map_err(|e| EnrichError::Config(e.to_string()))?;
        Self::new(db, config, Arc::new(search), Arc::new(detail), event_bus)
    }

    /// Replace the continuation policy consulted before FETCHING_DETAIL
    pub fn with_continuation(mut self, policy: Arc<dyn ContinuationPolicy>) -> Self {
        self.continuation = policy;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one run over `inputs`
    ///
    /// Blank ids are rejected before LOADING. Store failures end the run in
    /// ERROR and are returned as `Err`; cancellation and pause end the run
    /// with a summary.
    pub async fn run(
        &self,
        inputs: Vec<InputItem>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> EnrichResult<RunSummary> {
        let batch = Batch::from_inputs(inputs)?;
        let session = RunSession::new(batch.batch_key());

        tracing::info!(
            run_id = %session.run_id,
            batch_key = %short_key(&session.batch_key),
            records = batch.len(),
            dry_run = options.dry_run,
            "Starting enrichment run"
        );
        self.event_bus.emit_lossy(EnrichEvent::RunStarted {
            run_id: session.run_id,
            batch_key: session.batch_key.clone(),
            total: batch.len(),
            timestamp: Utc::now(),
        });

        let mut ctx = RunContext {
            session,
            batch,
            options,
            records: Vec::new(),
            index: HashMap::new(),
            stored: HashMap::new(),
            previous_checkpoint: None,
            dirty: BTreeSet::new(),
            outcomes: BTreeMap::new(),
            thresholds: Vec::new(),
            retries: 0,
            search_calls: 0,
            detail_calls: 0,
            cancel,
        };

        match self.run_phases(&mut ctx).await {
            Ok(final_state) => {
                ctx.session.transition_to(final_state);
                let summary = self.build_summary(&ctx);
                tracing::info!(
                    run_id = %ctx.run_id(),
                    state = %final_state,
                    succeeded = summary.succeeded,
                    not_found = summary.not_found,
                    failed_retryable = summary.failed_retryable,
                    failed_fatal = summary.failed_fatal,
                    reused = summary.reused,
                    pending = summary.pending,
                    candidates = summary.candidates,
                    "Enrichment run finished"
                );
                self.emit_finished(&ctx);
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(run_id = %ctx.run_id(), state = %ctx.session.state, error = %e, "Enrichment run failed");
                ctx.session.transition_to(PipelineState::Error);
                if ctx.writes_enabled() {
                    // Best effort: the store may be what failed
                    if let Err(cp_err) = self
                        .progress
                        .checkpoint(&ctx.session.batch_key, PipelineState::Error, ctx.batch.len())
                        .await
                    {
                        tracing::debug!(error = %cp_err, "Could not checkpoint failed run");
                    }
                }
                self.emit_finished(&ctx);
                Err(e)
            }
        }
    }

    async fn run_phases(&self, ctx: &mut RunContext) -> EnrichResult<PipelineState> {
        self.phase_loading(ctx).await?;

        if let PhaseFlow::Stop(state) = self.phase_dedup(ctx).await? {
            return self.stop(ctx, state).await;
        }
        if let PhaseFlow::Stop(state) = self.phase_resolving(ctx).await? {
            return self.stop(ctx, state).await;
        }
        if let PhaseFlow::Stop(state) = self.phase_filtering(ctx).await? {
            return self.stop(ctx, state).await;
        }
        if let PhaseFlow::Stop(state) = self.phase_fetching(ctx).await? {
            return self.stop(ctx, state).await;
        }

        self.phase_persisting(ctx).await?;
        if ctx.writes_enabled() {
            self.progress
                .checkpoint(&ctx.session.batch_key, PipelineState::Done, ctx.batch.len())
                .await?;
        }
        Ok(PipelineState::Done)
    }

    /// Flush pending writes and checkpoint a run ending early
    async fn stop(&self, ctx: &mut RunContext, state: PipelineState) -> EnrichResult<PipelineState> {
        tracing::info!(run_id = %ctx.run_id(), state = %state, "Run stopping early");
        self.flush_dirty(ctx).await?;
        if ctx.writes_enabled() {
            self.progress
                .checkpoint(&ctx.session.batch_key, state, ctx.batch.len())
                .await?;
        }
        Ok(state)
    }

    /// Write every record changed in memory but not yet persisted
    async fn flush_dirty(&self, ctx: &mut RunContext) -> EnrichResult<usize> {
        if !ctx.writes_enabled() || ctx.dirty.is_empty() {
            return Ok(0);
        }
        let pending: Vec<Record> = ctx
            .dirty
            .iter()
            .filter_map(|id| ctx.index.get(id).map(|&i| ctx.records[i].clone()))
            .collect();
        self.store.upsert(&pending).await?;
        ctx.dirty.clear();
        Ok(pending.len())
    }

    /// Enter a stage: transition, event, log
    fn begin_stage(&self, ctx: &mut RunContext, state: PipelineState, pending: usize) -> std::time::Instant {
        ctx.session.transition_to(state);
        tracing::info!(run_id = %ctx.run_id(), pending, "Stage {}", state);
        self.event_bus.emit_lossy(EnrichEvent::StageStarted {
            run_id: ctx.run_id(),
            stage: state.as_str().to_string(),
            pending,
            timestamp: Utc::now(),
        });
        std::time::Instant::now()
    }

    /// Leave a stage: event, and checkpoint unless this is a dry run
    async fn end_stage(
        &self,
        ctx: &RunContext,
        state: PipelineState,
        processed: usize,
        started: std::time::Instant,
    ) -> EnrichResult<()> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(run_id = %ctx.run_id(), processed, elapsed_ms, "Stage {} complete", state);
        self.event_bus.emit_lossy(EnrichEvent::StageCompleted {
            run_id: ctx.run_id(),
            stage: state.as_str().to_string(),
            processed,
            elapsed_ms,
            timestamp: Utc::now(),
        });
        if ctx.writes_enabled() {
            self.progress
                .checkpoint(&ctx.session.batch_key, state, ctx.batch.len())
                .await?;
        }
        Ok(())
    }

    fn build_summary(&self, ctx: &RunContext) -> RunSummary {
        let mut summary = RunSummary {
            run_id: ctx.run_id(),
            batch_key: ctx.session.batch_key.clone(),
            final_state: ctx.session.state,
            dry_run: ctx.options.dry_run,
            total_requested: 0,
            status_counts: BTreeMap::new(),
            candidates: 0,
            reused: 0,
            succeeded: 0,
            not_found: 0,
            failed_retryable: 0,
            failed_fatal: 0,
            pending: 0,
            retries: ctx.retries,
            search_calls: ctx.search_calls,
            detail_calls: ctx.detail_calls,
            thresholds: ctx.thresholds.clone(),
            outcomes: BTreeMap::new(),
            started_at: ctx.session.started_at,
            ended_at: ctx.session.ended_at.unwrap_or_else(Utc::now),
        };
        summary.tally(&ctx.records, &ctx.outcomes);
        summary
    }

    fn emit_finished(&self, ctx: &RunContext) {
        self.event_bus.emit_lossy(EnrichEvent::RunFinished {
            run_id: ctx.run_id(),
            state: ctx.session.state.as_str().to_string(),
            timestamp: Utc::now(),
        });
    }
}
