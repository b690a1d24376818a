//! Scripted search and detail backends
//!
//! Both mocks are keyed by record id. Scripted errors are returned first, in
//! order; after that the configured answer (or NotFound) is returned.

use async_trait::async_trait;
use bibscout_enrich::error::FetchError;
use bibscout_enrich::services::{
    CatalogSearch, DetailLookup, DetailRequest, DetailSource, SearchHit, SearchOutcome, SearchQuery,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MockSearch {
    hits: Mutex<HashMap<String, (f64, i64)>>,
    errors: Mutex<HashMap<String, VecDeque<FetchError>>>,
    calls: AtomicU64,
    per_id_calls: Mutex<HashMap<String, u64>>,
    user_agents: Mutex<Vec<Option<String>>>,
    /// Cancel this token once the given number of calls has been made
    cancel_after: Mutex<Option<(u64, CancellationToken)>>,
}

impl MockSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `id` with a link and the given coarse signals
    pub fn hit(&self, id: &str, score: f64, votes: i64) -> &Self {
        self.hits.lock().unwrap().insert(id.to_string(), (score, votes));
        self
    }

    /// Fail the next calls for `id` with these errors, in order
    pub fn fail_with(&self, id: &str, errors: Vec<FetchError>) -> &Self {
        self.errors
            .lock()
            .unwrap()
            .insert(id.to_string(), errors.into_iter().collect());
        self
    }

    pub fn cancel_after(&self, calls: u64, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((calls, token));
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, id: &str) -> u64 {
        self.per_id_calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn user_agents(&self) -> Vec<Option<String>> {
        self.user_agents.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogSearch for MockSearch {
    async fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .per_id_calls
            .lock()
            .unwrap()
            .entry(query.record_id.clone())
            .or_insert(0) += 1;
        self.user_agents.lock().unwrap().push(query.user_agent.clone());

        if let Some((limit, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if n >= *limit {
                token.cancel();
            }
        }

        let scripted = self
            .errors
            .lock()
            .unwrap()
            .get_mut(&query.record_id)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        let hit = self.hits.lock().unwrap().get(&query.record_id).copied();
        Ok(match hit {
            Some((score, votes)) => SearchOutcome::Found(SearchHit {
                link: format!("https://catalog.test/subject/{}", query.record_id),
                score: Some(score),
                votes: Some(votes),
            }),
            None => SearchOutcome::NotFound,
        })
    }
}

#[derive(Default)]
pub struct MockDetail {
    not_found: Mutex<HashSet<String>>,
    errors: Mutex<HashMap<String, VecDeque<FetchError>>>,
    calls: AtomicU64,
    requested: Mutex<Vec<String>>,
}

impl MockDetail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_found(&self, id: &str) -> &Self {
        self.not_found.lock().unwrap().insert(id.to_string());
        self
    }

    pub fn fail_with(&self, id: &str, errors: Vec<FetchError>) -> &Self {
        self.errors
            .lock()
            .unwrap()
            .insert(id.to_string(), errors.into_iter().collect());
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Record ids requested so far, in call order
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

/// Detail payload shaped like the public book API
pub fn detail_payload(id: &str) -> Value {
    json!({
        "id": id,
        "title": format!("  Title {}  ", id),
        "author": ["Liu Cixin", {"name": "Ken Liu"}],
        "pages": "302页",
        "rating": {"average": "8.8", "numRaters": 1234},
        "summary": "",
    })
}

#[async_trait]
impl DetailSource for MockDetail {
    async fn fetch(&self, request: &DetailRequest) -> Result<DetailLookup, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(request.record_id.clone());

        let scripted = self
            .errors
            .lock()
            .unwrap()
            .get_mut(&request.record_id)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        if self.not_found.lock().unwrap().contains(&request.record_id) {
            return Ok(DetailLookup::NotFound);
        }
        Ok(DetailLookup::Found(detail_payload(&request.record_id)))
    }
}
