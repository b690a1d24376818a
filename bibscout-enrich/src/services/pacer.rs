//! Anti-detection pacing for link resolution
//!
//! Each attempt waits a randomized delay and presents the next client identity
//! from the pool. Every `cooldown_interval` processed records the whole stage
//! pauses for a longer randomized cooldown. Rate-limit signals from the target
//! widen the per-attempt delay range for the rest of the run.

use crate::error::FetchError;
use bibscout_common::config::AntiDetectionConfig;
use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct PacerState {
    widen: f64,
    processed: usize,
    next_agent: usize,
}

/// Shared by all link-resolution workers of one run
#[derive(Debug)]
pub struct Pacer {
    config: AntiDetectionConfig,
    agents: Vec<String>,
    state: Mutex<PacerState>,
    /// Held for writing while a cooldown is in progress
    gate: RwLock<()>,
}

impl Pacer {
    pub fn new(config: AntiDetectionConfig) -> Self {
        let agents = config
            .user_agents
            .iter()
            .map(|ua| ua.trim().to_string())
            .filter(|ua| !ua.is_empty())
            .collect();
        Self {
            config,
            agents,
            state: Mutex::new(PacerState {
                widen: 1.0,
                processed: 0,
                next_agent: 0,
            }),
            gate: RwLock::new(()),
        }
    }

    /// Randomized pre-attempt delay within the (possibly widened) range
    pub fn attempt_delay(&self) -> Duration {
        let widen = self.widen_factor();
        let min = self.config.delay_min_ms as f64 * widen;
        let max = self.config.delay_max_ms as f64 * widen;
        Duration::from_millis(random_between(min, max) as u64)
    }

    /// Next client identity, round-robin over the configured pool
    pub fn next_user_agent(&self) -> Option<String> {
        if self.agents.is_empty() {
            return None;
        }
        let mut state = self.lock_state();
        let agent = self.agents[state.next_agent % self.agents.len()].clone();
        state.next_agent = state.next_agent.wrapping_add(1);
        Some(agent)
    }

    /// Wait for any running cooldown, then the per-attempt delay
    pub async fn pause_before_attempt(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            guard = self.gate.read() => drop(guard),
        }
        sleep_or_cancel(self.attempt_delay(), cancel).await
    }

    /// Widen the delay range after a rate-limit signal
    pub fn note_rate_limited(&self) {
        let mut state = self.lock_state();
        let widened = (state.widen * self.config.widen_factor).min(self.config.max_widen_factor);
        if widened > state.widen {
            tracing::warn!(
                widen_factor = widened,
                "Target signalled rate limiting, widening pacing delay"
            );
            state.widen = widened;
        }
    }

    /// Count one processed record
    ///
    /// Returns the cooldown to apply when the count reaches a multiple of
    /// `cooldown_interval`.
    pub fn record_processed(&self) -> Option<Duration> {
        let mut state = self.lock_state();
        state.processed += 1;
        let interval = self.config.cooldown_interval;
        if interval > 0 && state.processed % interval == 0 {
            let ms = random_between(
                self.config.cooldown_min_ms as f64,
                self.config.cooldown_max_ms as f64,
            );
            Some(Duration::from_millis(ms as u64))
        } else {
            None
        }
    }

    /// Hold every worker for `duration`; returns early on cancellation
    pub async fn cooldown(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), FetchError> {
        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            guard = self.gate.write() => guard,
        };
        tracing::info!(duration_ms = duration.as_millis() as u64, "Cooldown pause");
        sleep_or_cancel(duration, cancel).await
    }

    pub fn widen_factor(&self) -> f64 {
        self.lock_state().widen
    }

    pub fn processed(&self) -> usize {
        self.lock_state().processed
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PacerState> {
        // State holds only counters; a panic elsewhere cannot leave it invalid
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn random_between(min: f64, max: f64) -> f64 {
    if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), FetchError> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
