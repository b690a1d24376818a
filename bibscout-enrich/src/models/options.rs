//! Per-run flags

use serde::{Deserialize, Serialize};

/// Stage skip / resume flags for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Do not classify stored records (no staleness resets)
    pub skip_dedup: bool,
    /// Do not run link resolution
    pub skip_links: bool,
    /// Do not run the detail fetch
    pub skip_detail: bool,
    /// Trust the batch checkpoint instead of re-running classification
    pub light_resume: bool,
    /// Always run full classification (overrides `light_resume`)
    pub force: bool,
    /// Reset every record in the batch and resolve from scratch
    pub refresh: bool,
    /// DEDUP + FILTERING only: no network calls, no writes
    pub dry_run: bool,
}

impl RunOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    /// Light resume applies only when not forced
    pub fn wants_light_resume(&self) -> bool {
        self.light_resume && !self.force && !self.refresh
    }
}
