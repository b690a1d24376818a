//! bibscout-enrich library interface
//!
//! Resumable multi-stage enrichment: dedup against the store, rate-limited
//! link resolution, statistical candidate filtering, and detail fetch for
//! candidates only. Exposed as a library so integration tests can drive the
//! pipeline with mock services.

pub mod db;
pub mod error;
pub mod input;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{EnrichError, EnrichResult, FetchError};
pub use crate::models::{InputItem, Record, RecordStatus, RunOptions, RunSummary};
pub use crate::services::PipelineOrchestrator;
