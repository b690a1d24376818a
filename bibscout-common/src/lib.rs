//! # bibscout common library
//!
//! Shared code for the bibscout crates:
//! - Error type
//! - Pipeline configuration (TOML + environment)
//! - Database initialization and schema
//! - Event bus for run progress

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
