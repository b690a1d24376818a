//! Phase: PERSISTING
//!
//! Final unified write-back. Only records touched by this run and not yet
//! written are upserted; untouched records are left exactly as stored.

use super::{PipelineOrchestrator, RunContext};
use crate::error::EnrichResult;
use crate::models::PipelineState;

impl PipelineOrchestrator {
    pub(super) async fn phase_persisting(&self, ctx: &mut RunContext) -> EnrichResult<()> {
        let pending = ctx.dirty.len();
        let started = self.begin_stage(ctx, PipelineState::Persisting, pending);

        if ctx.options.dry_run {
            tracing::info!(run_id = %ctx.run_id(), would_write = pending, "Dry run: nothing written");
            ctx.dirty.clear();
        } else {
            let written = self.flush_dirty(ctx).await?;
            tracing::info!(run_id = %ctx.run_id(), written, "Write-back complete");
        }

        self.end_stage(ctx, PipelineState::Persisting, pending, started).await
    }
}
