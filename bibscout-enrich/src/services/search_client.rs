//! External catalog search used by link resolution
//!
//! The search results page carries the reference link plus coarse quality
//! signals (rating, vote count), which is all link resolution needs.

use crate::error::FetchError;
use async_trait::async_trait;
use bibscout_common::config::SearchConfig;
use serde::Deserialize;
use std::time::Duration;

/// One search request
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub record_id: String,
    /// Secondary key (ISBN) or title fallback
    pub key: String,
    /// Client identity for this attempt
    pub user_agent: Option<String>,
}

/// Best match from the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub link: String,
    pub score: Option<f64>,
    pub votes: Option<i64>,
}

/// Search result; `NotFound` is a valid outcome, not an error
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Found(SearchHit),
    NotFound,
}

/// Catalog search backend
#[async_trait]
pub trait CatalogSearch: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, FetchError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(alias = "url")]
    link: Option<String>,
    #[serde(default)]
    rating: Option<serde_json::Value>,
    #[serde(default, alias = "rating_count", alias = "numRaters")]
    votes: Option<serde_json::Value>,
}

/// HTTP implementation against a JSON search endpoint
pub struct HttpCatalogSearch {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpCatalogSearch {
    pub fn new(config: &SearchConfig) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FetchError::Fatal(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl CatalogSearch for HttpCatalogSearch {
    async fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, FetchError> {
        tracing::debug!(record_id = %query.record_id, key = %query.key, "Querying catalog search");

        let mut request = self
            .http_client
            .get(&self.base_url)
            .query(&[("q", query.key.as_str())]);
        if let Some(agent) = &query.user_agent {
            request = request.header(reqwest::header::USER_AGENT, agent);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(SearchOutcome::NotFound);
        }
        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16(), "catalog search"));
        }

        let body = response.text().await?;
        parse_search_response(&body)
    }
}

/// Pick the first result carrying a link
pub fn parse_search_response(body: &str) -> Result<SearchOutcome, FetchError> {
    let response: SearchResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("search response: {}", e)))?;

    let hit = response
        .results
        .into_iter()
        .find_map(|r| {
            let link = r.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty())?;
            Some(SearchHit {
                link,
                score: r.rating.as_ref().and_then(as_f64).filter(|s| *s > 0.0),
                votes: r.votes.as_ref().and_then(as_i64),
            })
        });

    Ok(match hit {
        Some(hit) => SearchOutcome::Found(hit),
        None => SearchOutcome::NotFound,
    })
}

/// Numbers may arrive as JSON numbers or numeric strings; `inf`/`NaN` are dropped
fn as_f64(value: &serde_json::Value) -> Option<f64> {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

fn as_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_linked_result() {
        let body = r#"{"results":[
            {"link": "", "rating": 9.0, "votes": 10},
            {"url": "https://catalog.example.org/item/42", "rating": "8.4", "votes": "1290"}
        ]}"#;

        let outcome = parse_search_response(body).unwrap();
        assert_eq!(
            outcome,
            SearchOutcome::Found(SearchHit {
                link: "https://catalog.example.org/item/42".to_string(),
                score: Some(8.4),
                votes: Some(1290),
            })
        );
    }

    #[test]
    fn test_non_finite_rating_treated_as_unrated() {
        for rating in ["\"inf\"", "\"-infinity\"", "\"NaN\""] {
            let body = format!(
                r#"{{"results":[{{"link": "https://x/1", "rating": {}, "votes": 12}}]}}"#,
                rating
            );
            match parse_search_response(&body).unwrap() {
                SearchOutcome::Found(hit) => {
                    assert_eq!(hit.score, None, "rating {}", rating);
                    assert_eq!(hit.votes, Some(12));
                }
                other => panic!("expected a hit, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_unrated_hit_keeps_link() {
        let body = r#"{"results":[{"link": "https://x/1", "rating": 0, "votes": null}]}"#;
        match parse_search_response(body).unwrap() {
            SearchOutcome::Found(hit) => {
                assert_eq!(hit.score, None);
                assert_eq!(hit.votes, None);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_empty_results_not_found() {
        assert_eq!(parse_search_response(r#"{"results":[]}"#).unwrap(), SearchOutcome::NotFound);
        assert_eq!(parse_search_response("{}").unwrap(), SearchOutcome::NotFound);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = parse_search_response("<html>captcha</html>").unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }
}
