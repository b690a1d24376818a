//! Data models for the enrichment pipeline

pub mod batch;
pub mod options;
pub mod record;
pub mod run_session;
pub mod summary;

pub use batch::Batch;
pub use options::RunOptions;
pub use record::{DetailMap, InputItem, Record, RecordStatus, UNCATEGORIZED};
pub use run_session::{PipelineState, RunSession, StateTransition};
pub use summary::{RecordOutcome, RunSummary};
