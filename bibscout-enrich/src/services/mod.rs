//! Pipeline components
//!
//! Leaf-first: rate limiting, retry and pacing wrap every outbound call; the
//! link resolver and detail fetcher are the two outbound stages; the threshold
//! filter sits between them; the orchestrator sequences everything.

pub mod continuation;
pub mod detail_client;
pub mod detail_fetcher;
pub mod field_mapping;
pub mod link_resolver;
pub mod pacer;
pub mod pipeline_orchestrator;
pub mod progress_tracker;
pub mod rate_limiter;
pub mod retry_policy;
pub mod search_client;
pub mod stage_report;
pub mod threshold_filter;

pub use continuation::{AlwaysContinue, CheckpointContext, Continuation, ContinuationPolicy, StdinPrompt};
pub use detail_client::{DetailLookup, DetailRequest, DetailSource, HttpDetailSource};
pub use detail_fetcher::DetailFetcher;
pub use field_mapping::FieldMapper;
pub use link_resolver::LinkResolver;
pub use pacer::Pacer;
pub use pipeline_orchestrator::PipelineOrchestrator;
pub use progress_tracker::ProgressTracker;
pub use rate_limiter::{RateLimiter, RatePermit};
pub use retry_policy::{Attempted, Classify, RetryClass, RetryFailure, RetryPolicy};
pub use search_client::{CatalogSearch, HttpCatalogSearch, SearchHit, SearchOutcome, SearchQuery};
pub use stage_report::StageReport;
pub use threshold_filter::{CategoryThreshold, FilterReport};
