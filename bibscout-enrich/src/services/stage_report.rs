//! Result of one outbound stage (link resolution or detail fetch)

use crate::models::{Record, RecordOutcome};
use std::collections::BTreeMap;

/// Records a stage touched plus per-id outcomes and call counters
#[derive(Debug, Default)]
pub struct StageReport {
    /// Records whose fields changed, in completion order
    pub updated: Vec<Record>,
    pub outcomes: BTreeMap<String, RecordOutcome>,
    /// Outbound calls actually issued (attempts that passed the limiter)
    pub calls: u64,
    /// Attempts beyond the first, summed over records
    pub retries: u64,
    /// Stage stopped early because the run was cancelled
    pub cancelled: bool,
}

impl StageReport {
    pub(crate) fn record(&mut self, record: Record, outcome: RecordOutcome) {
        self.outcomes.insert(record.id.clone(), outcome);
        self.updated.push(record);
    }

    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }
}
