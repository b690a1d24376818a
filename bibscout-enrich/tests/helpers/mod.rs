//! Test Helper Utilities
//!
//! Shared utilities for testing bibscout-enrich

#![allow(dead_code)]

pub mod db_utils;
pub mod mocks;

pub use db_utils::{create_test_db, done_record, has_column, seed_records, stored, test_store};
pub use mocks::{detail_payload, MockDetail, MockSearch};

use bibscout_common::config::PipelineConfig;
use bibscout_common::events::EventBus;
use bibscout_enrich::models::InputItem;
use bibscout_enrich::PipelineOrchestrator;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Configuration with pacing disabled and millisecond backoff
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.link_stage.max_concurrency = 4;
    config.link_stage.qps = 1_000.0;
    config.detail_stage.max_concurrency = 4;
    config.detail_stage.qps = 1_000.0;

    config.retry.max_attempts = 4;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter_ratio = 0.0;
    config.retry.rate_limit_multiplier = 1.0;
    config.retry.lock_wait_ms = 1_000;

    config.anti_detection.delay_min_ms = 0;
    config.anti_detection.delay_max_ms = 0;
    config.anti_detection.cooldown_interval = 0;

    config.filter.min_sample_size = 10;
    config.filter.default_min_score = 7.0;
    config
}

/// Orchestrator wired to the given mocks
pub fn orchestrator(
    pool: &SqlitePool,
    config: PipelineConfig,
    search: &Arc<MockSearch>,
    detail: &Arc<MockDetail>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        pool.clone(),
        config,
        search.clone(),
        detail.clone(),
        EventBus::new(1_000),
    )
    .expect("valid test configuration")
}

/// Input rows `prefix-000 .. prefix-(n-1)` in one classification
pub fn inputs(prefix: &str, n: usize, classification: &str) -> Vec<InputItem> {
    (0..n)
        .map(|i| {
            let id = format!("{}-{:03}", prefix, i);
            InputItem::new(id.clone(), Some(format!("isbn-{}", id))).with_classification(classification)
        })
        .collect()
}

pub fn ids(items: &[InputItem]) -> Vec<String> {
    items.iter().map(|i| i.id.clone()).collect()
}
