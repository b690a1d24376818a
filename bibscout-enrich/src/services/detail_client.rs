//! External detail API
//!
//! Keyed by the resolved link when present, otherwise by the secondary key.
//! Authentication is a bearer key, and authenticated requests only ever go to
//! the origin of the configured `base_url`. A link on another host is reduced
//! to its last path segment and looked up under `base_url`.

use crate::error::FetchError;
use async_trait::async_trait;
use bibscout_common::config::DetailConfig;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;

/// One detail request
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRequest {
    pub record_id: String,
    pub link: Option<String>,
    pub secondary_key: Option<String>,
}

/// Detail result; `NotFound` is terminal for the record, not an error
#[derive(Debug, Clone, PartialEq)]
pub enum DetailLookup {
    Found(Value),
    NotFound,
}

/// Detail API backend
#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn fetch(&self, request: &DetailRequest) -> Result<DetailLookup, FetchError>;
}

/// HTTP implementation
pub struct HttpDetailSource {
    http_client: reqwest::Client,
    base: Url,
    base_url: String,
    api_key: Option<String>,
}

impl HttpDetailSource {
    pub fn new(config: &DetailConfig, api_key: Option<String>) -> Result<Self, FetchError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let base = Url::parse(&base_url)
            .map_err(|e| FetchError::Fatal(format!("invalid detail base_url {}: {}", base_url, e)))?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FetchError::Fatal(format!("HTTP client build failed: {}", e)))?;

        if api_key.is_none() {
            tracing::warn!("No detail API key configured; requests are sent unauthenticated");
        }

        Ok(Self {
            http_client,
            base,
            base_url,
            api_key,
        })
    }

    /// URL for one request, always on the `base_url` origin
    fn request_url(&self, request: &DetailRequest) -> Result<String, FetchError> {
        if let Some(link) = request.link.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            match Url::parse(link) {
                Ok(url) if url.origin() == self.base.origin() => return Ok(url.to_string()),
                Ok(url) => {
                    if let Some(item) = last_segment(&url) {
                        tracing::debug!(
                            record_id = %request.record_id,
                            host = url.host_str().unwrap_or(""),
                            "Link is off the detail API origin, looking up by item id"
                        );
                        return Ok(format!("{}/{}", self.base_url, item));
                    }
                }
                Err(_) => return Ok(format!("{}/{}", self.base_url, link.trim_start_matches('/'))),
            }
        }

        match request.secondary_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => Ok(format!("{}/{}", self.base_url, key)),
            None => Err(FetchError::Fatal(
                "record has neither a usable link nor a secondary key".into(),
            )),
        }
    }
}

fn last_segment(url: &Url) -> Option<&str> {
    url.path_segments()?.filter(|s| !s.is_empty()).last()
}

#[async_trait]
impl DetailSource for HttpDetailSource {
    async fn fetch(&self, request: &DetailRequest) -> Result<DetailLookup, FetchError> {
        let url = self.request_url(request)?;

        tracing::debug!(record_id = %request.record_id, url = %url, "Querying detail API");

        let mut builder = self.http_client.get(&url);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(DetailLookup::NotFound);
        }
        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16(), "detail API"));
        }

        let body = response.text().await?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| FetchError::MalformedResponse(format!("detail response: {}", e)))?;

        Ok(DetailLookup::Found(value))
    }
}
