//! Continue/pause decision between filtering and detail fetch

use async_trait::async_trait;
use std::io::{BufRead, Write};
use uuid::Uuid;

/// Decision taken at the checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Continue,
    /// Persist progress and stop before FETCHING_DETAIL
    Pause,
}

/// What the policy gets to look at
#[derive(Debug, Clone)]
pub struct CheckpointContext {
    pub run_id: Uuid,
    pub total: usize,
    pub link_acquired: usize,
    pub candidates: usize,
    /// Candidates that would be fetched if the run continues
    pub pending_detail: usize,
}

#[async_trait]
pub trait ContinuationPolicy: Send + Sync {
    async fn decide(&self, context: &CheckpointContext) -> Continuation;
}

/// Non-interactive default
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysContinue;

#[async_trait]
impl ContinuationPolicy for AlwaysContinue {
    async fn decide(&self, _context: &CheckpointContext) -> Continuation {
        Continuation::Continue
    }
}

/// Asks on the terminal; anything but an explicit "n"/"p" continues
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompt;

#[async_trait]
impl ContinuationPolicy for StdinPrompt {
    async fn decide(&self, context: &CheckpointContext) -> Continuation {
        let prompt = format!(
            "{} of {} records linked, {} candidates, {} need detail. Fetch detail now? [Y/n] ",
            context.link_acquired, context.total, context.candidates, context.pending_detail
        );

        let answer = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            let _ = write!(stdout, "{}", prompt);
            let _ = stdout.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => parse_answer(&line),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Could not read continuation answer, continuing");
                Continuation::Continue
            }
            Err(e) => {
                tracing::warn!(error = %e, "Continuation prompt task failed, continuing");
                Continuation::Continue
            }
        }
    }
}

fn parse_answer(line: &str) -> Continuation {
    match line.trim().to_ascii_lowercase().as_str() {
        "n" | "no" | "p" | "pause" => Continuation::Pause,
        _ => Continuation::Continue,
    }
}
