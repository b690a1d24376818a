//! Phase: LOADING
//!
//! Builds the in-memory batch from the input rows and whatever the store
//! already holds for those ids.

use super::{PipelineOrchestrator, RunContext};
use crate::error::EnrichResult;
use crate::models::{PipelineState, Record};

impl PipelineOrchestrator {
    pub(super) async fn phase_loading(&self, ctx: &mut RunContext) -> EnrichResult<()> {
        let total = ctx.batch.len();
        let started = self.begin_stage(ctx, PipelineState::Loading, total);

        // Read before this run overwrites it with its own progress
        ctx.previous_checkpoint = self.progress.last_checkpoint(&ctx.session.batch_key).await?;
        if let Some(cp) = &ctx.previous_checkpoint {
            tracing::info!(
                run_id = %ctx.run_id(),
                previous_state = %cp.state,
                updated_at = %cp.updated_at,
                "Found checkpoint from earlier run of this batch"
            );
        }

        let ids = ctx.batch.ids();
        let stored = self.store.lookup(&ids).await?;

        let mut records = Vec::with_capacity(total);
        let mut dirty = Vec::new();
        for item in ctx.batch.items() {
            let record = match stored.get(&item.id) {
                Some(existing) => {
                    let mut record = existing.clone();
                    if record.merge_input(item) {
                        dirty.push(item.id.clone());
                    }
                    record
                }
                None => {
                    dirty.push(item.id.clone());
                    Record::new(item)
                }
            };
            records.push(record);
        }

        ctx.index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        ctx.records = records;
        ctx.stored = stored;
        for id in dirty {
            ctx.mark_dirty(&id);
        }

        tracing::info!(
            run_id = %ctx.run_id(),
            total,
            stored = ctx.stored.len(),
            new = total - ctx.stored.len(),
            duplicates_collapsed = ctx.batch.duplicates(),
            "Batch loaded"
        );

        self.end_stage(ctx, PipelineState::Loading, total, started).await
    }
}
