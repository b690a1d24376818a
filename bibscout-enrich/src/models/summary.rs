//! Run summary returned to the caller for reporting

use super::record::{Record, RecordStatus};
use super::run_session::PipelineState;
use crate::services::progress_tracker::status_counts;
use crate::services::threshold_filter::CategoryThreshold;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// What happened to one requested id during this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// No work was needed (valid in store, or already complete)
    Reused,
    /// At least one stage advanced the record
    Succeeded,
    /// The external source confirmed there is no data (terminal, not an error)
    NotFound,
    /// Retries exhausted on a transient error; eligible next run
    FailedRetryable,
    /// Fatal error for this record
    FailedFatal,
    /// Work remains but was not attempted (skipped stage, dry run, cancel, pause)
    Pending,
}

/// Aggregate result of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub batch_key: String,
    pub final_state: PipelineState,
    pub dry_run: bool,
    pub total_requested: usize,
    pub status_counts: BTreeMap<RecordStatus, usize>,
    pub candidates: usize,
    pub reused: usize,
    pub succeeded: usize,
    pub not_found: usize,
    pub failed_retryable: usize,
    pub failed_fatal: usize,
    pub pending: usize,
    /// Retry attempts absorbed by the retry policy (internal counter)
    pub retries: u64,
    pub search_calls: u64,
    pub detail_calls: u64,
    pub thresholds: Vec<CategoryThreshold>,
    pub outcomes: BTreeMap<String, RecordOutcome>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunSummary {
    /// Tally counters from the final record set and per-id outcomes
    ///
    /// Every record gets exactly one outcome; ids with none recorded are
    /// classified as `Pending` when work remains and `Reused` otherwise.
    pub fn tally(&mut self, records: &[Record], outcomes: &BTreeMap<String, RecordOutcome>) {
        self.total_requested = records.len();
        self.status_counts = status_counts(records);
        self.candidates = records.iter().filter(|r| r.is_candidate).count();
        self.outcomes.clear();

        for record in records {
            let outcome = match outcomes.get(&record.id) {
                Some(outcome) => *outcome,
                None if has_remaining_work(record) => RecordOutcome::Pending,
                None => RecordOutcome::Reused,
            };
            self.outcomes.insert(record.id.clone(), outcome);
        }

        let mut counts: BTreeMap<RecordOutcome, usize> = BTreeMap::new();
        for outcome in self.outcomes.values() {
            *counts.entry(*outcome).or_insert(0) += 1;
        }
        let count = |wanted: RecordOutcome| counts.get(&wanted).copied().unwrap_or(0);
        self.reused = count(RecordOutcome::Reused);
        self.succeeded = count(RecordOutcome::Succeeded);
        self.not_found = count(RecordOutcome::NotFound);
        self.failed_retryable = count(RecordOutcome::FailedRetryable);
        self.failed_fatal = count(RecordOutcome::FailedFatal);
        self.pending = count(RecordOutcome::Pending);
    }
}

fn has_remaining_work(record: &Record) -> bool {
    record.status == RecordStatus::NeedsLink || record.needs_detail()
}
