//! Phase: FETCHING_DETAIL

use super::{PhaseFlow, PipelineOrchestrator, RunContext};
use crate::error::EnrichResult;
use crate::models::{PipelineState, Record};
use crate::services::detail_fetcher::DetailFetcher;

impl PipelineOrchestrator {
    pub(super) async fn phase_fetching(&self, ctx: &mut RunContext) -> EnrichResult<PhaseFlow> {
        if ctx.options.skip_detail || ctx.options.dry_run {
            tracing::info!(
                run_id = %ctx.run_id(),
                skip_detail = ctx.options.skip_detail,
                dry_run = ctx.options.dry_run,
                "Skipping FETCHING_DETAIL"
            );
            return Ok(PhaseFlow::Continue);
        }

        let pending = ctx.records_where(Record::needs_detail);
        let started = self.begin_stage(ctx, PipelineState::FetchingDetail, pending.len());

        let fetcher = DetailFetcher::new(
            self.detail.clone(),
            self.detail_limiter.clone(),
            self.retry.clone(),
            self.mapper.clone(),
            self.store.clone(),
            self.event_bus.clone(),
            self.config.stale_after_days,
        );

        let report = fetcher.fetch_all(ctx.run_id(), pending, &ctx.cancel).await?;
        let processed = report.processed();
        let cancelled = report.cancelled;
        ctx.detail_calls += report.calls;
        ctx.merge(report);

        if cancelled || ctx.cancel.is_cancelled() {
            tracing::info!(run_id = %ctx.run_id(), processed, "Cancelled during FETCHING_DETAIL");
            return Ok(PhaseFlow::Stop(PipelineState::Cancelled));
        }

        self.end_stage(ctx, PipelineState::FetchingDetail, processed, started).await?;
        Ok(PhaseFlow::Continue)
    }
}
