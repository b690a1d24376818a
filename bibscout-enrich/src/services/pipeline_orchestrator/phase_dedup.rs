//! Phase: DEDUP
//!
//! Full classification of the batch against the store: valid records are
//! reused as-is, stale ones (or all of them with `refresh`) are reset to
//! NEEDS_LINK and written back before any network work starts.
//!
//! Skipped with `skip_dedup`, or under light resume when the batch already
//! has a checkpoint. `force` and `refresh` always classify.

use super::{PhaseFlow, PipelineOrchestrator, RunContext};
use crate::db::records::classify_full;
use crate::error::EnrichResult;
use crate::models::{PipelineState, RecordStatus};
use chrono::Utc;

impl PipelineOrchestrator {
    pub(super) async fn phase_dedup(&self, ctx: &mut RunContext) -> EnrichResult<PhaseFlow> {
        let total = ctx.records.len();
        let started = self.begin_stage(ctx, PipelineState::Dedup, total);

        let options = &ctx.options;
        let must_classify = options.force || options.refresh;
        let light_resume = options.wants_light_resume() && ctx.previous_checkpoint.is_some();

        if !must_classify && (options.skip_dedup || light_resume) {
            tracing::info!(
                run_id = %ctx.run_id(),
                skip_dedup = options.skip_dedup,
                light_resume,
                "Skipping classification, trusting stored record status"
            );
        } else {
            let ids = ctx.batch.ids();
            let classification = classify_full(&ids, &ctx.stored, Utc::now());

            let reset_ids: Vec<String> = if ctx.options.refresh {
                ctx.records
                    .iter()
                    .filter(|r| r.status > RecordStatus::NeedsLink || r.link.is_some())
                    .map(|r| r.id.clone())
                    .collect()
            } else {
                classification.stale.clone()
            };

            for id in &reset_ids {
                if let Some(&i) = ctx.index.get(id) {
                    ctx.records[i].reset_for_refresh();
                    ctx.dirty.insert(id.clone());
                }
            }

            tracing::info!(
                run_id = %ctx.run_id(),
                valid = classification.valid.len(),
                stale = classification.stale.len(),
                new = classification.new.len(),
                reset = reset_ids.len(),
                refresh = ctx.options.refresh,
                "Batch classified"
            );
        }

        let written = self.flush_dirty(ctx).await?;
        if written > 0 {
            tracing::debug!(run_id = %ctx.run_id(), written, "Persisted new and reset records");
        }

        self.end_stage(ctx, PipelineState::Dedup, total, started).await?;

        if ctx.cancel.is_cancelled() {
            return Ok(PhaseFlow::Stop(PipelineState::Cancelled));
        }
        Ok(PhaseFlow::Continue)
    }
}
