//! Rate-limited HTTP GET with retry, used inside connector fetch functions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::cache::SourceKey;

/// Upstream error bodies (census API messages, HTML error pages) are cut to
/// this many characters in `FetchError::HttpStatus`.
const ERROR_SNIPPET_CHARS: usize = 200;

/// Retry schedule for transient failures: 5xx, 429, timeouts and
/// connection errors. Other statuses fail on the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Doubling delay capped at `max_delay`. A server-supplied Retry-After
    /// wins when it is longer, but is still capped.
    pub fn delay(&self, retry: usize, retry_after: Option<Duration>) -> Duration {
        let doubled = match u32::try_from(retry).ok().and_then(|r| 1u32.checked_shl(r)) {
            Some(factor) => self.base_delay.saturating_mul(factor),
            None => self.max_delay,
        };
        doubled.max(retry_after.unwrap_or_default()).min(self.max_delay)
    }

    pub fn retries_status(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }

    pub fn retries_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout; bulk downloads need generous values.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across all sources.
    pub max_in_flight: usize,
    /// Requests in flight against one source.
    pub max_in_flight_per_source: usize,
    pub retry: RetryPolicy,
    /// Requests per second allowed per source, with bursts up to the
    /// limiter's capacity. `None` disables limiting.
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_source: 2,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub burst: u32,
    pub per_second: f64,
}

/// Token bucket refilled continuously; fractional tokens carry over so a
/// slow rate is not rounded away.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new((f64::from(limit.burst), Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        let burst = f64::from(self.limit.burst.max(1));
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let refill = now.duration_since(state.1).as_secs_f64() * self.limit.per_second;
                state.0 = (state.0 + refill).min(burst);
                state.1 = now;
                if state.0 >= 1.0 {
                    state.0 -= 1.0;
                    return;
                }
                if self.limit.per_second <= 0.0 {
                    Duration::from_secs(1)
                } else {
                    Duration::from_secs_f64((1.0 - state.0) / self.limit.per_second)
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Failure of a connector's fetch function.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("http status {status} for {url}: {snippet}")]
    HttpStatus {
        status: u16,
        url: String,
        snippet: String,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("source {source_id} unavailable: {message}")]
    Unavailable { source_id: String, message: String },
}

enum Attempt {
    Done(FetchedResponse),
    Retry {
        retry_after: Option<Duration>,
        failure: FetchError,
    },
    Fail(FetchError),
}

/// Shared HTTP client. Concurrency is bounded globally and per source id.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_source_limit: usize,
    sources: Mutex<HashMap<String, (Arc<Semaphore>, Option<Arc<RateLimiter>>)>>,
    rate_limit: Option<RateLimit>,
    retry: RetryPolicy,
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
        Ok(Self {
            client: builder.build().map_err(FetchError::Client)?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_source_limit: config.max_in_flight_per_source.max(1),
            sources: Mutex::new(HashMap::new()),
            rate_limit: config.rate_limit,
            retry: config.retry,
        })
    }

    async fn source_limits(&self, source_id: &str) -> (Arc<Semaphore>, Option<Arc<RateLimiter>>) {
        let mut sources = self.sources.lock().await;
        sources
            .entry(source_id.to_string())
            .or_insert_with(|| {
                (
                    Arc::new(Semaphore::new(self.per_source_limit)),
                    self.rate_limit.map(|l| Arc::new(RateLimiter::new(l))),
                )
            })
            .clone()
    }

    /// GET the url and query parameters recorded in `key`.
    pub async fn fetch(&self, source_id: &str, key: &SourceKey) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = key.url());
        async move {
            let (source_slots, limiter) = self.source_limits(source_id).await;
            let _global = self.in_flight.acquire().await.expect("semaphore not closed");
            let _source = source_slots.acquire().await.expect("semaphore not closed");

            let mut retry = 0;
            loop {
                if let Some(limiter) = &limiter {
                    limiter.acquire().await;
                }
                match self.attempt(key, retry + 1).await {
                    Attempt::Done(response) => return Ok(response),
                    Attempt::Fail(err) => return Err(err),
                    Attempt::Retry { failure, .. } if retry >= self.retry.max_retries => {
                        return Err(failure)
                    }
                    Attempt::Retry {
                        retry_after,
                        failure,
                    } => {
                        let delay = self.retry.delay(retry, retry_after);
                        warn!(error = %failure, ?delay, retry = retry + 1, "transient fetch failure");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, key: &SourceKey, attempts: usize) -> Attempt {
        let request_error = |source: reqwest::Error| FetchError::Request {
            url: key.url().to_string(),
            attempts,
            source,
        };
        let resp = match self.client.get(key.url()).query(key.params()).send().await {
            Ok(resp) => resp,
            Err(err) if RetryPolicy::retries_error(&err) => {
                return Attempt::Retry {
                    retry_after: None,
                    failure: request_error(err),
                }
            }
            Err(err) => return Attempt::Fail(request_error(err)),
        };

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let retry_after = retry_after(&resp);
            let snippet = error_snippet(resp).await;
            let failure = FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                snippet,
            };
            return if RetryPolicy::retries_status(status) {
                Attempt::Retry {
                    retry_after,
                    failure,
                }
            } else {
                Attempt::Fail(failure)
            };
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        match resp.bytes().await {
            Ok(body) => {
                debug!(bytes = body.len(), attempts, "fetched");
                Attempt::Done(FetchedResponse {
                    status,
                    final_url,
                    content_type,
                    body: body.to_vec(),
                })
            }
            // body cut off mid-transfer
            Err(err) if RetryPolicy::retries_error(&err) || err.is_body() => Attempt::Retry {
                retry_after: None,
                failure: request_error(err),
            },
            Err(err) => Attempt::Fail(request_error(err)),
        }
    }
}

/// Only the delta-seconds form; HTTP dates are ignored.
fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn error_snippet(resp: Response) -> String {
    let text = resp.text().await.unwrap_or_default();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match text.char_indices().nth(ERROR_SNIPPET_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay(2, None), Duration::from_millis(350));
        assert_eq!(policy.delay(64, None), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_extends_but_never_exceeds_the_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(0, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(60))), Duration::from_secs(5));
        assert_eq!(
            policy.delay(1, Some(Duration::from_millis(10))),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn only_transient_statuses_are_retried() {
        assert!(RetryPolicy::retries_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(RetryPolicy::retries_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!RetryPolicy::retries_status(StatusCode::NOT_FOUND));
        assert!(!RetryPolicy::retries_status(StatusCode::BAD_REQUEST));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_allows_a_burst_then_paces() {
        let limiter = RateLimiter::new(RateLimit {
            burst: 2,
            per_second: 4.0,
        });
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(1));

        limiter.acquire().await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(249), "{waited:?}");
        assert!(waited < Duration::from_millis(400), "{waited:?}");
    }

    #[tokio::test]
    async fn unreachable_hosts_fail_without_panicking() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..Default::default()
        })
        .unwrap();
        let key = SourceKey::from_url("http://127.0.0.1:9/unreachable");
        let err = fetcher.fetch("test", &key).await.unwrap_err();
        assert!(
            matches!(err, FetchError::Request { attempts: 2, .. }),
            "{err}"
        );
    }
}
