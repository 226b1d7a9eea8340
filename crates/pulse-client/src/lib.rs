//! Tracker API client infrastructure: error taxonomy, shared rate limiter,
//! retry coordination, and the resumable pagination engine.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tracing::warn;

pub mod api;
pub mod wire;

pub use api::{ClientConfig, TrackerClient};

pub const CRATE_NAME: &str = "pulse-client";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rate limited (retry-after: {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status} for {url}")]
    Server { status: u16, url: String },
    #[error("authentication rejected ({status}) for {url}")]
    Auth { status: u16, url: String },
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("unexpected status {status} for {url}")]
    Unexpected { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported page request for {url}")]
    Unsupported { url: String },
}

impl ApiError {
    /// Retry predicate: transient network faults, 429, and 5xx retry; every
    /// other class is fatal for the call.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            ApiError::RateLimited { .. } | ApiError::Server { .. } => true,
            ApiError::Auth { .. }
            | ApiError::NotFound { .. }
            | ApiError::Unexpected { .. }
            | ApiError::Decode { .. }
            | ApiError::Unsupported { .. } => false,
        }
    }
}

/// Maps a non-success HTTP status to the error taxonomy.
pub fn classify_status(status: StatusCode, url: &str, retry_after: Option<Duration>) -> ApiError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth {
            status: status.as_u16(),
            url: url.to_string(),
        },
        StatusCode::NOT_FOUND => ApiError::NotFound {
            url: url.to_string(),
        },
        s if s.is_server_error() => ApiError::Server {
            status: s.as_u16(),
            url: url.to_string(),
        },
        s => ApiError::Unexpected {
            status: s.as_u16(),
            url: url.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            token_bucket: None,
        }
    }
}

/// Shared limiter bounding both in-flight concurrency and call rate. The
/// semaphore queue is FIFO, so no collection can starve the others of
/// permits.
#[derive(Debug)]
pub struct RateLimiter {
    inflight: Semaphore,
    bucket: Option<TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inflight: Semaphore::new(config.concurrency.max(1)),
            bucket: config
                .token_bucket
                .map(|c| TokenBucket::new(c.capacity, c.refill_every)),
        }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        let permit = self.inflight.acquire().await.expect("semaphore not closed");
        if let Some(bucket) = &self.bucket {
            bucket.take().await;
        }
        permit
    }
}

/// Reusable retry policy: bounded attempts, exponential backoff with jitter,
/// server-specified delay for 429s. Attempts of one logical call are
/// serialized by construction; independent calls may race up to the shared
/// limiter cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential schedule before jitter: `base * 2^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Uniform jitter in `[delay/2, delay]`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let half = delay / 2;
        if half.is_zero() {
            return delay;
        }
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }

    /// Runs `op` until success, a non-retryable error, or attempt exhaustion.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.max_attempts.max(1) {
                        return Err(err);
                    }
                    let delay = match &err {
                        ApiError::RateLimited {
                            retry_after: Some(server_delay),
                        } => *server_delay,
                        _ => self.jittered(self.delay_for_attempt(attempt - 1)),
                    };
                    warn!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

/// One page request. Offset paging is only safe for collections that are not
/// mutated during iteration (closed/historical collections); use cursors for
/// live collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    Offset {
        skip: usize,
        top: usize,
    },
    Cursor {
        cursor: Option<String>,
        direction: Direction,
        top: usize,
    },
}

impl PageRequest {
    pub fn top(&self) -> usize {
        match self {
            PageRequest::Offset { top, .. } | PageRequest::Cursor { top, .. } => *top,
        }
    }
}

/// Resume descriptor returned with every page. Cursors denote the gap
/// between two adjacent items and are stable under concurrent inserts
/// elsewhere in the collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    Offset {
        next_skip: usize,
    },
    Cursor {
        next_cursor: Option<String>,
        direction: Direction,
    },
}

impl Resume {
    pub fn next_request(&self, top: usize) -> PageRequest {
        match self {
            Resume::Offset { next_skip } => PageRequest::Offset {
                skip: *next_skip,
                top,
            },
            Resume::Cursor {
                next_cursor,
                direction,
            } => PageRequest::Cursor {
                cursor: next_cursor.clone(),
                direction: *direction,
                top,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub resume: Resume,
    pub has_more: bool,
}

/// One paged collection endpoint.
#[async_trait]
pub trait PageSource: Sync {
    type Item: Send;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<Self::Item>, ApiError>;
}

/// Iterates a collection to exhaustion. Pages are merged strictly in resume
/// order; a later page is never requested before the previous one resolved.
pub async fn drain<S: PageSource>(source: &S, first: PageRequest) -> Result<Vec<S::Item>, ApiError> {
    let top = first.top();
    let mut request = first;
    let mut items = Vec::new();
    loop {
        let page = source.fetch_page(&request).await?;
        items.extend(page.items);
        if !page.has_more {
            return Ok(items);
        }
        request = page.resume.next_request(top);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn backoff_schedule_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::default();
        let delay = Duration::from_millis(200);
        for _ in 0..50 {
            let jittered = policy.jittered(delay);
            assert!(jittered >= delay / 2);
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "u", None),
            ApiError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "u", None),
            ApiError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "u", None),
            ApiError::NotFound { .. }
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, "u", None).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "u", None).is_retryable());
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicUsize::new(0);
        let result = policy
            .run("test", || async {
                if calls.fetch_add(1, AtomicOrdering::SeqCst) < 2 {
                    Err(ApiError::Server {
                        status: 503,
                        url: "u".into(),
                    })
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_never_retry() {
        let policy = RetryPolicy::default();
        let calls = AtomicUsize::new(0);
        let result: Result<(), ApiError> = policy
            .run("test", || async {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                Err(ApiError::Auth {
                    status: 403,
                    url: "u".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(ApiError::Auth { .. })));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded_by_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let calls = AtomicUsize::new(0);
        let result: Result<(), ApiError> = policy
            .run("test", || async {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                Err(ApiError::Server {
                    status: 500,
                    url: "u".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 4);
    }

    #[tokio::test]
    async fn token_bucket_blocks_until_refill() {
        let bucket = TokenBucket::new(2, Duration::from_millis(10));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    /// In-memory ordered collection with gap cursors encoded as
    /// `left^right` around the gap position.
    struct GapCursorSource {
        items: Vec<&'static str>,
    }

    impl GapCursorSource {
        fn encode(&self, gap: usize) -> String {
            let left = gap.checked_sub(1).map(|i| self.items[i]).unwrap_or("");
            let right = self.items.get(gap).copied().unwrap_or("");
            format!("{left}^{right}")
        }

        fn gap_index(&self, cursor: Option<&str>, direction: Direction) -> usize {
            match cursor {
                None => match direction {
                    Direction::Forward => 0,
                    Direction::Backward => self.items.len(),
                },
                Some(c) => {
                    let left = c.split('^').next().unwrap_or("");
                    if left.is_empty() {
                        0
                    } else {
                        self.items.iter().position(|i| *i == left).map(|i| i + 1).unwrap_or(0)
                    }
                }
            }
        }
    }

    #[async_trait]
    impl PageSource for GapCursorSource {
        type Item = &'static str;

        async fn fetch_page(
            &self,
            request: &PageRequest,
        ) -> Result<Page<Self::Item>, ApiError> {
            let PageRequest::Cursor {
                cursor,
                direction,
                top,
            } = request
            else {
                return Err(ApiError::Unsupported { url: "mem".into() });
            };
            let gap = self.gap_index(cursor.as_deref(), *direction);
            match direction {
                Direction::Forward => {
                    let take = (*top).min(self.items.len() - gap);
                    let items = self.items[gap..gap + take].to_vec();
                    Ok(Page {
                        items,
                        resume: Resume::Cursor {
                            next_cursor: Some(self.encode(gap + take)),
                            direction: *direction,
                        },
                        has_more: gap + take < self.items.len(),
                    })
                }
                Direction::Backward => {
                    let take = (*top).min(gap);
                    let mut items = self.items[gap - take..gap].to_vec();
                    items.reverse();
                    Ok(Page {
                        items,
                        resume: Resume::Cursor {
                            next_cursor: Some(self.encode(gap - take)),
                            direction: *direction,
                        },
                        has_more: gap > take,
                    })
                }
            }
        }
    }

    fn abcd() -> GapCursorSource {
        GapCursorSource {
            items: vec!["A", "B", "C", "D"],
        }
    }

    #[tokio::test]
    async fn cursor_page_is_bounded_by_adjacent_gaps() {
        let source = abcd();
        let page = source
            .fetch_page(&PageRequest::Cursor {
                cursor: Some("A^B".into()),
                direction: Direction::Forward,
                top: 1,
            })
            .await
            .unwrap();
        assert_eq!(page.items, vec!["B"]);
        assert_eq!(
            page.resume,
            Resume::Cursor {
                next_cursor: Some("B^C".into()),
                direction: Direction::Forward,
            }
        );
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn forward_and_backward_from_same_gap_are_symmetric() {
        let source = abcd();
        let forward = drain(
            &source,
            PageRequest::Cursor {
                cursor: Some("B^C".into()),
                direction: Direction::Forward,
                top: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(forward, vec!["C", "D"]);

        let backward = drain(
            &source,
            PageRequest::Cursor {
                cursor: Some("B^C".into()),
                direction: Direction::Backward,
                top: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(backward, vec!["B", "A"]);
    }

    #[tokio::test]
    async fn rerequesting_the_same_cursor_is_idempotent() {
        let source = abcd();
        let request = PageRequest::Cursor {
            cursor: Some("A^B".into()),
            direction: Direction::Forward,
            top: 2,
        };
        let first = source.fetch_page(&request).await.unwrap();
        let second = source.fetch_page(&request).await.unwrap();
        assert_eq!(first.items, second.items);
        assert_eq!(first.resume, second.resume);
    }

    struct OffsetSource {
        items: Vec<u32>,
    }

    #[async_trait]
    impl PageSource for OffsetSource {
        type Item = u32;

        async fn fetch_page(
            &self,
            request: &PageRequest,
        ) -> Result<Page<Self::Item>, ApiError> {
            let PageRequest::Offset { skip, top } = request else {
                return Err(ApiError::Unsupported { url: "mem".into() });
            };
            let skip = (*skip).min(self.items.len());
            let take = (*top).min(self.items.len() - skip);
            Ok(Page {
                items: self.items[skip..skip + take].to_vec(),
                resume: Resume::Offset {
                    next_skip: skip + take,
                },
                has_more: skip + take < self.items.len(),
            })
        }
    }

    #[tokio::test]
    async fn drain_merges_offset_pages_in_order() {
        let source = OffsetSource {
            items: (0..25).collect(),
        };
        let all = drain(&source, PageRequest::Offset { skip: 0, top: 10 })
            .await
            .unwrap();
        assert_eq!(all, (0..25).collect::<Vec<_>>());
    }
}
