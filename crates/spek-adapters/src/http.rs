//! Shared HTTP client for marketplace calls: request timeout, global
//! concurrency cap and optional request pacing. Failed requests are returned
//! as-is; the next sweep is the retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            rate_limit: None,
        }
    }
}

/// At most `burst` requests back to back, then one more per `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Allowance {
    available: u32,
    refilled_at: Instant,
}

impl Allowance {
    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        if config.refill_every.is_zero() {
            self.available = config.burst;
            self.refilled_at = now;
            return;
        }
        let periods = now.saturating_duration_since(self.refilled_at).as_nanos()
            / config.refill_every.as_nanos();
        if periods == 0 {
            return;
        }
        let gained = periods.min(u128::from(config.burst)) as u32;
        self.available = self.available.saturating_add(gained).min(config.burst);
        // A full allowance restarts the clock; otherwise keep the partial period.
        self.refilled_at = if self.available == config.burst {
            now
        } else {
            self.refilled_at + config.refill_every * gained
        };
    }

    fn wait_for_next(&self, config: &RateLimitConfig, now: Instant) -> Duration {
        (self.refilled_at + config.refill_every).saturating_duration_since(now)
    }
}

/// Paces outgoing marketplace requests so a sweep over many queries does not
/// hammer the upstream API.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    allowance: Mutex<Allowance>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            burst: config.burst.max(1),
            ..config
        };
        Self {
            config,
            allowance: Mutex::new(Allowance {
                available: config.burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Waits until a request may go out and claims its slot.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut allowance = self.allowance.lock().await;
                let now = Instant::now();
                allowance.refill(&self.config, now);
                if allowance.available > 0 {
                    allowance.available -= 1;
                    return;
                }
                allowance.wait_for_next(&self.config, now)
            };
            debug!(?wait, "rate limited");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            rate_limiter: config.rate_limit.map(|c| Arc::new(RateLimiter::new(c))),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn rate_limit(&self) -> Option<RateLimitConfig> {
        self.rate_limiter.as_ref().map(|limiter| limiter.config())
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}
