//! Listing source contract + the Marktplaats adapter behind it.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use spek_core::{Listing, SearchParams, ValidationError};
use thiserror::Error;
use tokio::sync::Mutex;

mod http;
mod marktplaats;
mod query_url;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RateLimitConfig, RateLimiter};
pub use marktplaats::{decode_search_response, search_url, MarktplaatsSource, SearchPage, MARKTPLAATS_BASE_URL};
pub use query_url::{apply_fragment, category_ids_from_html, category_slugs, parse_marketplace_url};

pub const CRATE_NAME: &str = "spek-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// Marketplace search capability used by the runner. Implementations must not
/// filter listings on policy grounds; the runner owns that decision.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Current first page of listings matching `params`, in marketplace order.
    async fn search(&self, params: &SearchParams) -> Result<Vec<Listing>, SourceError>;

    /// Turns a marketplace search URL copied from a browser into search params.
    async fn resolve_query_url(&self, url: &str) -> Result<SearchParams, SourceError>;
}

/// Scripted source: each `search` pops the next queued page, falling back to
/// the last page once the queue is drained.
#[derive(Debug, Default)]
pub struct StaticSource {
    state: Mutex<StaticState>,
}

#[derive(Debug, Default)]
struct StaticState {
    pages: VecDeque<Result<Vec<Listing>, String>>,
    last: Vec<Listing>,
    urls: HashMap<String, SearchParams>,
    calls: usize,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listings(listings: Vec<Listing>) -> Self {
        Self {
            state: Mutex::new(StaticState {
                last: listings,
                ..Default::default()
            }),
        }
    }

    pub async fn push_page(&self, listings: Vec<Listing>) {
        self.state.lock().await.pages.push_back(Ok(listings));
    }

    pub async fn push_failure(&self, message: impl Into<String>) {
        self.state.lock().await.pages.push_back(Err(message.into()));
    }

    pub async fn register_url(&self, url: impl Into<String>, params: SearchParams) {
        self.state.lock().await.urls.insert(url.into(), params);
    }

    pub async fn calls(&self) -> usize {
        self.state.lock().await.calls
    }
}

#[async_trait]
impl ListingSource for StaticSource {
    fn source_id(&self) -> &'static str {
        "static"
    }

    async fn search(&self, _params: &SearchParams) -> Result<Vec<Listing>, SourceError> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        match state.pages.pop_front() {
            Some(Ok(page)) => {
                state.last = page.clone();
                Ok(page)
            }
            Some(Err(message)) => Err(SourceError::Message(message)),
            None => Ok(state.last.clone()),
        }
    }

    async fn resolve_query_url(&self, url: &str) -> Result<SearchParams, SourceError> {
        let state = self.state.lock().await;
        state
            .urls
            .get(url)
            .cloned()
            .ok_or_else(|| ValidationError::InvalidUrl(url.to_string()).into())
    }
}
