//! Statistical candidate selection
//!
//! Records at `LINK_ACQUIRED` or beyond are grouped by category. For a category
//! with at least `min_sample_size` scored records:
//!
//! - the golden vote range is `[p(review_lower), p(review_upper)]` of `coarse_votes`
//! - the score cut is `p(rating_percentile)` of `coarse_score` among records
//!   inside the golden range
//!
//! A record is a candidate iff its votes fall inside the golden range and its
//! score is at or above both the cut and the category's absolute floor.
//! Smaller categories use the floor alone. Percentiles interpolate linearly
//! between closest ranks and categories are iterated in key order, so the
//! result depends only on the input signals.

use crate::models::{Record, RecordStatus};
use bibscout_common::config::FilterConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Thresholds computed for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryThreshold {
    pub category: String,
    /// Records in the category carrying both coarse signals
    pub sample_size: usize,
    /// False when the category fell back to the absolute floor
    pub percentile_applied: bool,
    pub votes_lower: Option<f64>,
    pub votes_upper: Option<f64>,
    pub score_cut: Option<f64>,
    pub min_score: f64,
    pub candidates: usize,
}

impl CategoryThreshold {
    /// Candidate predicate for one record's coarse signals
    pub fn admits(&self, score: f64, votes: i64) -> bool {
        if score < self.min_score {
            return false;
        }
        if !self.percentile_applied {
            return true;
        }
        match (self.votes_lower, self.votes_upper, self.score_cut) {
            (Some(lower), Some(upper), Some(cut)) => {
                let votes = votes as f64;
                votes >= lower && votes <= upper && score >= cut
            }
            _ => false,
        }
    }
}

/// Outcome of one filter pass
#[derive(Debug, Clone, Default)]
pub struct FilterReport {
    pub thresholds: Vec<CategoryThreshold>,
    pub evaluated: usize,
    pub candidates: usize,
    /// Ids whose `is_candidate` flag flipped
    pub changed: Vec<String>,
}

/// Compute thresholds and set `is_candidate` on every eligible record
///
/// Records still at `NEEDS_LINK` are not evaluated. `DONE` records are
/// re-evaluated so reporting reflects the latest thresholds.
pub fn apply(records: &mut [Record], config: &FilterConfig) -> FilterReport {
    let thresholds = compute_thresholds(records, config);
    let by_category: BTreeMap<&str, &CategoryThreshold> = thresholds
        .iter()
        .map(|t| (t.category.as_str(), t))
        .collect();

    let mut report = FilterReport::default();
    for record in records.iter_mut() {
        if record.status < RecordStatus::LinkAcquired {
            continue;
        }
        report.evaluated += 1;

        let category = record.category(config.category_prefix_len);
        let candidate = match (record.coarse_signal(), by_category.get(category.as_str())) {
            (Some((score, votes)), Some(threshold)) => threshold.admits(score, votes),
            _ => false,
        };

        if candidate {
            report.candidates += 1;
        }
        if record.is_candidate != candidate {
            record.is_candidate = candidate;
            report.changed.push(record.id.clone());
        }
    }

    let mut thresholds = thresholds;
    for threshold in thresholds.iter_mut() {
        threshold.candidates = records
            .iter()
            .filter(|r| r.is_candidate && r.category(config.category_prefix_len) == threshold.category)
            .count();
    }

    for threshold in &thresholds {
        tracing::debug!(
            category = %threshold.category,
            sample_size = threshold.sample_size,
            percentile_applied = threshold.percentile_applied,
            votes_lower = ?threshold.votes_lower,
            votes_upper = ?threshold.votes_upper,
            score_cut = ?threshold.score_cut,
            min_score = threshold.min_score,
            candidates = threshold.candidates,
            "Category threshold"
        );
    }

    report.thresholds = thresholds;
    report
}

/// Per-category thresholds from the scored records, sorted by category
pub fn compute_thresholds(records: &[Record], config: &FilterConfig) -> Vec<CategoryThreshold> {
    let mut signals: BTreeMap<String, Vec<(f64, i64)>> = BTreeMap::new();
    for record in records {
        if record.status < RecordStatus::LinkAcquired {
            continue;
        }
        let entry = signals
            .entry(record.category(config.category_prefix_len))
            .or_default();
        if let Some(signal) = record.coarse_signal() {
            entry.push(signal);
        }
    }

    signals
        .into_iter()
        .map(|(category, scored)| {
            let min_score = config.min_score_for(&category);
            let mut threshold = CategoryThreshold {
                category,
                sample_size: scored.len(),
                percentile_applied: false,
                votes_lower: None,
                votes_upper: None,
                score_cut: None,
                min_score,
                candidates: 0,
            };

            if scored.len() >= config.min_sample_size.max(1) {
                let mut votes: Vec<f64> = scored.iter().map(|(_, v)| *v as f64).collect();
                votes.sort_by(f64::total_cmp);
                let lower = percentile(&votes, config.review_lower_percentile);
                let upper = percentile(&votes, config.review_upper_percentile);

                let mut in_range: Vec<f64> = scored
                    .iter()
                    .filter(|(_, v)| {
                        let v = *v as f64;
                        matches!((lower, upper), (Some(lo), Some(hi)) if v >= lo && v <= hi)
                    })
                    .map(|(s, _)| *s)
                    .collect();
                in_range.sort_by(f64::total_cmp);

                threshold.percentile_applied = true;
                threshold.votes_lower = lower;
                threshold.votes_upper = upper;
                threshold.score_cut = percentile(&in_range, config.rating_percentile);
            }

            threshold
        })
        .collect()
}

/// Linear-interpolation percentile of an ascending slice; `p` in [0, 100]
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
        }
    }
}
