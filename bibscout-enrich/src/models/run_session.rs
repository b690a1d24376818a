//! Pipeline run state machine
//!
//! LOADING → DEDUP → RESOLVING_LINKS → FILTERING → FETCHING_DETAIL → PERSISTING → DONE
//!
//! ERROR is reachable from any stage on a batch-level failure. CANCELLED and
//! PAUSED end a run early with every record at its last persisted status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Run-level pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Loading,
    Dedup,
    ResolvingLinks,
    Filtering,
    FetchingDetail,
    Persisting,
    Done,
    Error,
    Cancelled,
    Paused,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Loading => "LOADING",
            PipelineState::Dedup => "DEDUP",
            PipelineState::ResolvingLinks => "RESOLVING_LINKS",
            PipelineState::Filtering => "FILTERING",
            PipelineState::FetchingDetail => "FETCHING_DETAIL",
            PipelineState::Persisting => "PERSISTING",
            PipelineState::Done => "DONE",
            PipelineState::Error => "ERROR",
            PipelineState::Cancelled => "CANCELLED",
            PipelineState::Paused => "PAUSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Error | PipelineState::Cancelled | PipelineState::Paused
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineState {
    type Err = bibscout_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "LOADING" => PipelineState::Loading,
            "DEDUP" => PipelineState::Dedup,
            "RESOLVING_LINKS" => PipelineState::ResolvingLinks,
            "FILTERING" => PipelineState::Filtering,
            "FETCHING_DETAIL" => PipelineState::FetchingDetail,
            "PERSISTING" => PipelineState::Persisting,
            "DONE" => PipelineState::Done,
            "ERROR" => PipelineState::Error,
            "CANCELLED" => PipelineState::Cancelled,
            "PAUSED" => PipelineState::Paused,
            other => {
                return Err(bibscout_common::Error::InvalidInput(format!(
                    "Unknown pipeline state: {}",
                    other
                )))
            }
        })
    }
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub run_id: Uuid,
    pub old_state: PipelineState,
    pub new_state: PipelineState,
    pub transitioned_at: DateTime<Utc>,
}

/// In-memory run session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSession {
    pub run_id: Uuid,
    pub batch_key: String,
    pub state: PipelineState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunSession {
    pub fn new(batch_key: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            batch_key,
            state: PipelineState::Loading,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Transition to new state
    pub fn transition_to(&mut self, new_state: PipelineState) -> StateTransition {
        let transition = StateTransition {
            run_id: self.run_id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        tracing::debug!(
            run_id = %self.run_id,
            from = %self.state,
            to = %new_state,
            "Pipeline state transition"
        );
        self.state = new_state;

        if new_state.is_terminal() {
            self.ended_at = Some(transition.transitioned_at);
        }

        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_transition_sets_end_time() {
        let mut session = RunSession::new("key".to_string());
        assert_eq!(session.state, PipelineState::Loading);

        let t = session.transition_to(PipelineState::Dedup);
        assert_eq!(t.old_state, PipelineState::Loading);
        assert!(session.ended_at.is_none());

        session.transition_to(PipelineState::Cancelled);
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            PipelineState::Loading,
            PipelineState::ResolvingLinks,
            PipelineState::FetchingDetail,
            PipelineState::Paused,
        ] {
            assert_eq!(state.as_str().parse::<PipelineState>().unwrap(), state);
        }
    }
}
