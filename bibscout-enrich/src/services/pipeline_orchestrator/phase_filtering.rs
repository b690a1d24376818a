//! Phase: FILTERING
//!
//! Runs once over the whole batch after link resolution has drained, then
//! consults the continuation policy before any detail call.

use super::{PhaseFlow, PipelineOrchestrator, RunContext};
use crate::error::EnrichResult;
use crate::models::{PipelineState, RecordStatus};
use crate::services::continuation::{CheckpointContext, Continuation};
use crate::services::threshold_filter;

impl PipelineOrchestrator {
    pub(super) async fn phase_filtering(&self, ctx: &mut RunContext) -> EnrichResult<PhaseFlow> {
        let eligible = ctx
            .records
            .iter()
            .filter(|r| r.status >= RecordStatus::LinkAcquired)
            .count();
        let started = self.begin_stage(ctx, PipelineState::Filtering, eligible);

        let report = threshold_filter::apply(&mut ctx.records, &self.config.filter);
        for id in &report.changed {
            ctx.dirty.insert(id.clone());
        }

        // Candidates waiting for detail move to NEEDS_DETAIL
        let mut queued = 0;
        for record in ctx.records.iter_mut() {
            if record.is_candidate && record.advance_to(RecordStatus::NeedsDetail) {
                ctx.dirty.insert(record.id.clone());
                queued += 1;
            }
        }

        tracing::info!(
            run_id = %ctx.run_id(),
            evaluated = report.evaluated,
            candidates = report.candidates,
            flipped = report.changed.len(),
            queued_for_detail = queued,
            categories = report.thresholds.len(),
            "Candidates selected"
        );
        ctx.thresholds = report.thresholds;

        self.flush_dirty(ctx).await?;
        self.end_stage(ctx, PipelineState::Filtering, report.evaluated, started).await?;

        if ctx.cancel.is_cancelled() {
            return Ok(PhaseFlow::Stop(PipelineState::Cancelled));
        }

        if ctx.options.dry_run || ctx.options.skip_detail {
            return Ok(PhaseFlow::Continue);
        }

        let pending_detail = ctx.records.iter().filter(|r| r.needs_detail()).count();
        if pending_detail == 0 {
            return Ok(PhaseFlow::Continue);
        }

        let checkpoint = CheckpointContext {
            run_id: ctx.run_id(),
            total: ctx.records.len(),
            link_acquired: eligible,
            candidates: report.candidates,
            pending_detail,
        };
        match self.continuation.decide(&checkpoint).await {
            Continuation::Continue => Ok(PhaseFlow::Continue),
            Continuation::Pause => {
                tracing::info!(run_id = %ctx.run_id(), pending_detail, "Paused before FETCHING_DETAIL");
                Ok(PhaseFlow::Stop(PipelineState::Paused))
            }
        }
    }
}
