//! Configuration loading and path resolution
//!
//! Every component receives its settings through an explicit [`PipelineConfig`]
//! built once at startup. Resolution order for the config file:
//! 1. Command-line argument (highest priority)
//! 2. `BIBSCOUT_CONFIG` environment variable
//! 3. Platform config dir (`~/.config/bibscout/config.toml` on Linux)
//! 4. Built-in defaults (no file)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "BIBSCOUT_CONFIG";
/// Environment variable naming the SQLite database file
pub const DATABASE_ENV_VAR: &str = "BIBSCOUT_DB";
/// Environment variable carrying the detail API key
pub const DETAIL_API_KEY_ENV_VAR: &str = "BIBSCOUT_DETAIL_API_KEY";

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrency/QPS for the link resolution service
    pub link_stage: StageConfig,
    /// Concurrency/QPS for the detail API
    pub detail_stage: StageConfig,
    pub retry: RetryConfig,
    pub anti_detection: AntiDetectionConfig,
    pub filter: FilterConfig,
    pub search: SearchConfig,
    pub detail: DetailConfig,
    /// Days until a resolved record is considered stale
    pub stale_after_days: i64,
    /// SQLite database path (optional, see [`resolve_database_path`])
    pub database_path: Option<PathBuf>,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            link_stage: StageConfig {
                max_concurrency: 2,
                qps: 0.5,
            },
            detail_stage: StageConfig {
                max_concurrency: 4,
                qps: 4.0,
            },
            retry: RetryConfig::default(),
            anti_detection: AntiDetectionConfig::default(),
            filter: FilterConfig::default(),
            search: SearchConfig::default(),
            detail: DetailConfig::default(),
            stale_after_days: 90,
            database_path: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Per-service concurrency and rate caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Maximum in-flight operations
    pub max_concurrency: usize,
    /// Maximum acquisitions per second (may be fractional)
    pub qps: f64,
}

/// Retry/backoff settings shared by both outbound stages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Jitter as a fraction of the computed delay (0.1 = ±10%)
    pub jitter_ratio: f64,
    /// Attempt cap for malformed responses (never exceeds `max_attempts`)
    pub malformed_max_attempts: u32,
    /// Delay multiplier applied when the target signals rate limiting
    pub rate_limit_multiplier: f64,
    /// Maximum time to wait on SQLite lock contention per write
    pub lock_wait_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_ratio: 0.1,
            malformed_max_attempts: 2,
            rate_limit_multiplier: 2.0,
            lock_wait_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Pacing applied before every link-resolution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiDetectionConfig {
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Insert a cooldown after this many processed records (0 disables)
    pub cooldown_interval: usize,
    pub cooldown_min_ms: u64,
    pub cooldown_max_ms: u64,
    /// Multiplier applied to the delay range on each rate-limit signal
    pub widen_factor: f64,
    /// Upper bound on the accumulated widening
    pub max_widen_factor: f64,
    /// Client identity strings rotated across attempts
    pub user_agents: Vec<String>,
}

impl Default for AntiDetectionConfig {
    fn default() -> Self {
        Self {
            delay_min_ms: 1_500,
            delay_max_ms: 4_000,
            cooldown_interval: 25,
            cooldown_min_ms: 30_000,
            cooldown_max_ms: 60_000,
            widen_factor: 1.5,
            max_widen_factor: 4.0,
            user_agents: vec![
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
            ],
        }
    }
}

/// Statistical candidate selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Scored records a category needs before percentile logic applies
    pub min_sample_size: usize,
    pub review_lower_percentile: f64,
    pub review_upper_percentile: f64,
    pub rating_percentile: f64,
    /// Absolute score floor per category key
    pub category_min_score: BTreeMap<String, f64>,
    pub default_min_score: f64,
    /// Characters of the classification code forming the category key
    pub category_prefix_len: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 10,
            review_lower_percentile: 10.0,
            review_upper_percentile: 90.0,
            rating_percentile: 75.0,
            category_min_score: BTreeMap::new(),
            default_min_score: 7.0,
            category_prefix_len: 1,
        }
    }
}

impl FilterConfig {
    /// Absolute floor for a category, falling back to the global default
    pub fn min_score_for(&self, category: &str) -> f64 {
        self.category_min_score
            .get(category)
            .copied()
            .unwrap_or(self.default_min_score)
    }
}

/// External catalog search endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://catalog.example.org/search".to_string(),
            timeout_secs: 20,
        }
    }
}

/// External detail API endpoint and response mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub field_mappings: Vec<FieldMapping>,
}

impl Default for DetailConfig {
    fn default() -> Self {
        let mapping = |source: &str, target: &str, transform: FieldTransform| FieldMapping {
            source_key: source.to_string(),
            target_field: target.to_string(),
            transform,
        };
        Self {
            base_url: "https://api.example.org/v2/book".to_string(),
            api_key: None,
            timeout_secs: 30,
            field_mappings: vec![
                mapping("title", "title", FieldTransform::Trim),
                mapping("subtitle", "subtitle", FieldTransform::Trim),
                mapping("author", "authors", FieldTransform::JoinList),
                mapping("translator", "translators", FieldTransform::JoinList),
                mapping("publisher", "publisher", FieldTransform::Trim),
                mapping("pubdate", "published", FieldTransform::Trim),
                mapping("pages", "pages", FieldTransform::Integer),
                mapping("price", "price", FieldTransform::Trim),
                mapping("rating.average", "rating", FieldTransform::Number),
                mapping("rating.numRaters", "rating_count", FieldTransform::Integer),
                mapping("summary", "summary", FieldTransform::Trim),
                mapping("author_intro", "author_intro", FieldTransform::Trim),
                mapping("catalog", "table_of_contents", FieldTransform::Trim),
            ],
        }
    }
}

/// One row of the response → record field mapping table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dotted path into the response JSON (`rating.average`)
    pub source_key: String,
    /// Key written into the record's detail map
    pub target_field: String,
    #[serde(default)]
    pub transform: FieldTransform,
}

/// Value conversion applied while mapping a detail field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransform {
    /// Copy the JSON value as-is
    #[default]
    Identity,
    /// Strings trimmed; empty strings dropped
    Trim,
    /// Parse as floating-point number
    Number,
    /// Parse as integer (leading digits of strings such as "320页")
    Integer,
    /// Join a string array with ", "
    JoinList,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration following the documented resolution order
    ///
    /// An explicitly named file (CLI or environment) must exist; the
    /// platform default is optional.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let explicit = cli_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from));

        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                Some(path)
            }
            None => default_config_path().filter(|p| p.exists()),
        };

        match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
                let config = Self::from_toml_str(&content)?;
                info!("Configuration loaded from {}", path.display());
                Ok(config)
            }
            None => {
                info!("No config file found, using built-in defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Reject settings that would make a component misbehave at run time
    pub fn validate(&self) -> Result<()> {
        for (name, stage) in [("link_stage", &self.link_stage), ("detail_stage", &self.detail_stage)] {
            if stage.max_concurrency == 0 {
                return Err(Error::Config(format!("{}.max_concurrency must be > 0", name)));
            }
            if !(stage.qps.is_finite() && stage.qps > 0.0) {
                return Err(Error::Config(format!("{}.qps must be > 0", name)));
            }
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be >= 1".to_string()));
        }
        if retry.backoff_factor < 1.0 {
            return Err(Error::Config("retry.backoff_factor must be >= 1.0".to_string()));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(Error::Config("retry.base_delay_ms exceeds retry.max_delay_ms".to_string()));
        }
        if !(0.0..1.0).contains(&retry.jitter_ratio) {
            return Err(Error::Config("retry.jitter_ratio must be in [0, 1)".to_string()));
        }
        if retry.rate_limit_multiplier < 1.0 {
            return Err(Error::Config("retry.rate_limit_multiplier must be >= 1.0".to_string()));
        }

        let anti = &self.anti_detection;
        if anti.delay_min_ms > anti.delay_max_ms {
            return Err(Error::Config("anti_detection delay range is inverted".to_string()));
        }
        if anti.cooldown_min_ms > anti.cooldown_max_ms {
            return Err(Error::Config("anti_detection cooldown range is inverted".to_string()));
        }
        if anti.widen_factor < 1.0 || anti.max_widen_factor < 1.0 {
            return Err(Error::Config("anti_detection widen factors must be >= 1.0".to_string()));
        }
        if anti.user_agents.iter().all(|ua| ua.trim().is_empty()) {
            return Err(Error::Config("anti_detection.user_agents must not be empty".to_string()));
        }

        let filter = &self.filter;
        for (name, p) in [
            ("review_lower_percentile", filter.review_lower_percentile),
            ("review_upper_percentile", filter.review_upper_percentile),
            ("rating_percentile", filter.rating_percentile),
        ] {
            if !(0.0..=100.0).contains(&p) {
                return Err(Error::Config(format!("filter.{} must be in [0, 100]", name)));
            }
        }
        if filter.review_lower_percentile > filter.review_upper_percentile {
            return Err(Error::Config("filter review percentiles are inverted".to_string()));
        }
        if filter.category_prefix_len == 0 {
            return Err(Error::Config("filter.category_prefix_len must be > 0".to_string()));
        }

        if self.stale_after_days <= 0 {
            return Err(Error::Config("stale_after_days must be > 0".to_string()));
        }

        validate_field_mappings(&self.detail.field_mappings)
    }

    /// Resolve the detail API key
    ///
    /// **Priority:** ENV → TOML. Blank values count as absent.
    pub fn resolve_detail_api_key(&self) -> Option<String> {
        let env_key = std::env::var(DETAIL_API_KEY_ENV_VAR)
            .ok()
            .filter(|k| is_valid_key(k));
        let toml_key = self.detail.api_key.clone().filter(|k| is_valid_key(k));

        if env_key.is_some() && toml_key.is_some() {
            warn!("Detail API key found in environment and TOML. Using environment (highest priority).");
        }

        match (env_key, toml_key) {
            (Some(key), _) => {
                info!("Detail API key loaded from environment variable");
                Some(key)
            }
            (None, Some(key)) => {
                info!("Detail API key loaded from TOML config");
                Some(key)
            }
            (None, None) => None,
        }
    }
}

/// Validate the mapping table: non-empty keys, unique target fields
pub fn validate_field_mappings(mappings: &[FieldMapping]) -> Result<()> {
    let mut targets = HashSet::new();
    for mapping in mappings {
        if mapping.source_key.trim().is_empty() || mapping.source_key.split('.').any(str::is_empty) {
            return Err(Error::Config(format!(
                "Invalid field mapping source key: '{}'",
                mapping.source_key
            )));
        }
        if mapping.target_field.trim().is_empty() {
            return Err(Error::Config(format!(
                "Field mapping for '{}' has empty target field",
                mapping.source_key
            )));
        }
        if !targets.insert(mapping.target_field.as_str()) {
            return Err(Error::Config(format!(
                "Duplicate field mapping target: '{}'",
                mapping.target_field
            )));
        }
    }
    Ok(())
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Resolve the database path
///
/// **Priority:** CLI → `BIBSCOUT_DB` → TOML `database_path` → platform data dir
pub fn resolve_database_path(cli_arg: Option<&Path>, config: &PipelineConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(path) = &config.database_path {
        return path.clone();
    }
    default_data_dir().join("bibscout.db")
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bibscout").join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("bibscout"))
        .unwrap_or_else(|| PathBuf::from("./bibscout_data"))
}
