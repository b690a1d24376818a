//! Phase: RESOLVING_LINKS

use super::{PhaseFlow, PipelineOrchestrator, RunContext};
use crate::error::EnrichResult;
use crate::models::{PipelineState, RecordStatus};
use crate::services::link_resolver::LinkResolver;
use crate::services::pacer::Pacer;
use std::sync::Arc;

impl PipelineOrchestrator {
    pub(super) async fn phase_resolving(&self, ctx: &mut RunContext) -> EnrichResult<PhaseFlow> {
        if ctx.options.skip_links || ctx.options.dry_run {
            tracing::info!(
                run_id = %ctx.run_id(),
                skip_links = ctx.options.skip_links,
                dry_run = ctx.options.dry_run,
                "Skipping RESOLVING_LINKS"
            );
            return Ok(PhaseFlow::Continue);
        }

        let pending = ctx.records_where(|r| r.status < RecordStatus::LinkAcquired);
        let started = self.begin_stage(ctx, PipelineState::ResolvingLinks, pending.len());

        // Pacing state (widening, cooldown count) lasts for one run
        let resolver = LinkResolver::new(
            self.search.clone(),
            self.link_limiter.clone(),
            self.retry.clone(),
            Arc::new(Pacer::new(self.config.anti_detection.clone())),
            self.store.clone(),
            self.event_bus.clone(),
            self.config.stale_after_days,
        );

        let report = resolver.resolve(ctx.run_id(), pending, &ctx.cancel).await?;
        let processed = report.processed();
        let cancelled = report.cancelled;
        ctx.search_calls += report.calls;
        ctx.merge(report);

        if cancelled || ctx.cancel.is_cancelled() {
            tracing::info!(run_id = %ctx.run_id(), processed, "Cancelled during RESOLVING_LINKS");
            return Ok(PhaseFlow::Stop(PipelineState::Cancelled));
        }

        self.end_stage(ctx, PipelineState::ResolvingLinks, processed, started).await?;
        Ok(PhaseFlow::Continue)
    }
}
