//! Enrichment record model
//!
//! A record moves forward through `NEEDS_LINK → LINK_ACQUIRED → NEEDS_DETAIL → DONE`.
//! The only way back is [`Record::reset_for_refresh`], used for stale records
//! and explicit refresh runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Category key used when a record has no classification code
pub const UNCATEGORIZED: &str = "UNCATEGORIZED";

/// Enriched detail fields, keyed by mapped target field name
pub type DetailMap = BTreeMap<String, serde_json::Value>;

/// Per-record pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// No external link resolved yet
    NeedsLink,
    /// Link (and coarse signals, when available) resolved
    LinkAcquired,
    /// Selected as a candidate, waiting for the detail fetch
    NeedsDetail,
    /// Terminal for this record
    Done,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::NeedsLink => "NEEDS_LINK",
            RecordStatus::LinkAcquired => "LINK_ACQUIRED",
            RecordStatus::NeedsDetail => "NEEDS_DETAIL",
            RecordStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = bibscout_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEEDS_LINK" => Ok(RecordStatus::NeedsLink),
            "LINK_ACQUIRED" => Ok(RecordStatus::LinkAcquired),
            "NEEDS_DETAIL" => Ok(RecordStatus::NeedsDetail),
            "DONE" => Ok(RecordStatus::Done),
            other => Err(bibscout_common::Error::InvalidInput(format!(
                "Unknown record status: {}",
                other
            ))),
        }
    }
}

/// One input row: catalog id plus lookup hints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputItem {
    /// Stable external identifier (e.g. a catalog barcode)
    pub id: String,
    /// Lookup key for the external catalog (e.g. ISBN)
    pub secondary_key: Option<String>,
    /// Fallback search query when no secondary key exists
    pub title: Option<String>,
    /// Classification code (e.g. "I247.5"), source of the category key
    pub classification: Option<String>,
}

impl InputItem {
    pub fn new(id: impl Into<String>, secondary_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            secondary_key,
            title: None,
            classification: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }
}

/// The unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub secondary_key: Option<String>,
    pub title: Option<String>,
    pub classification: Option<String>,
    pub link: Option<String>,
    pub coarse_score: Option<f64>,
    pub coarse_votes: Option<i64>,
    pub detail: Option<DetailMap>,
    pub status: RecordStatus,
    pub is_candidate: bool,
    pub stale_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

impl Record {
    /// Fresh record for an input row never seen before
    pub fn new(item: &InputItem) -> Self {
        Self {
            id: item.id.clone(),
            secondary_key: non_blank(&item.secondary_key),
            title: non_blank(&item.title),
            classification: non_blank(&item.classification),
            link: None,
            coarse_score: None,
            coarse_votes: None,
            detail: None,
            status: RecordStatus::NeedsLink,
            is_candidate: false,
            stale_after: None,
            last_error: None,
            retry_count: 0,
        }
    }

    /// Refresh lookup hints from the current input row
    ///
    /// Returns true when any hint changed.
    pub fn merge_input(&mut self, item: &InputItem) -> bool {
        let mut changed = false;
        for (field, incoming) in [
            (&mut self.secondary_key, non_blank(&item.secondary_key)),
            (&mut self.title, non_blank(&item.title)),
            (&mut self.classification, non_blank(&item.classification)),
        ] {
            if incoming.is_some() && *field != incoming {
                *field = incoming;
                changed = true;
            }
        }
        changed
    }

    /// Category key: leading `prefix_len` characters of the classification, upper-cased
    pub fn category(&self, prefix_len: usize) -> String {
        match self.classification.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => code
                .chars()
                .take(prefix_len)
                .collect::<String>()
                .to_uppercase(),
            _ => UNCATEGORIZED.to_string(),
        }
    }

    /// Query used against the external catalog
    pub fn search_key(&self) -> Option<&str> {
        self.secondary_key.as_deref().or(self.title.as_deref())
    }

    /// Move forward to `status`; never moves backwards
    ///
    /// Returns true when the status changed.
    pub fn advance_to(&mut self, status: RecordStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }

    /// Record a resolved link and its coarse signals
    pub fn mark_link_acquired(
        &mut self,
        link: Option<String>,
        coarse_score: Option<f64>,
        coarse_votes: Option<i64>,
        stale_after: DateTime<Utc>,
    ) {
        if link.is_some() {
            self.link = link;
        }
        self.coarse_score = coarse_score;
        self.coarse_votes = coarse_votes;
        self.last_error = None;
        self.stale_after = Some(stale_after);
        self.advance_to(RecordStatus::LinkAcquired);
    }

    /// Finish the record; `detail` is None for confirmed not-found lookups
    pub fn mark_done(&mut self, detail: Option<DetailMap>, stale_after: DateTime<Utc>) {
        self.detail = detail;
        self.last_error = None;
        self.stale_after = Some(stale_after);
        self.advance_to(RecordStatus::Done);
    }

    /// Note a failed stage operation; status is left untouched
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Clear resolved state so the record is resolved again from scratch
    pub fn reset_for_refresh(&mut self) {
        self.link = None;
        self.coarse_score = None;
        self.coarse_votes = None;
        self.detail = None;
        self.is_candidate = false;
        self.last_error = None;
        self.stale_after = None;
        self.status = RecordStatus::NeedsLink;
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        matches!(self.stale_after, Some(at) if at <= now)
    }

    /// Both coarse signals present
    pub fn coarse_signal(&self) -> Option<(f64, i64)> {
        match (self.coarse_score, self.coarse_votes) {
            (Some(score), Some(votes)) => Some((score, votes)),
            _ => None,
        }
    }

    /// Candidate waiting for (or eligible for) the detail stage
    pub fn needs_detail(&self) -> bool {
        self.is_candidate
            && matches!(self.status, RecordStatus::LinkAcquired | RecordStatus::NeedsDetail)
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
