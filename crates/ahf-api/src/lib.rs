//! Battle.net Game Data API client: OAuth2 client credentials, shared rate
//! limiting and a lazy auction page sequence.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ahf_adapters::{parse_connected_realm, parse_page, parse_realm_index, NextPage};
use ahf_core::{ConnectedRealm, Region, COMMODITIES_REALM_ID};
use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "ahf-api";

/// Upper bound on pages per listing unless configured otherwise.
pub const DEFAULT_MAX_PAGES: usize = 1_000;

/// Tokens are treated as expired this long before the server says so.
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("transient failure: {reason}")]
    Transient { reason: String, status: Option<u16> },
    #[error("http status {status} for {url}")]
    Permanent { status: u16, url: String },
    #[error("undecodable response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl ApiError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ApiError::Transient { .. } => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }

    pub fn kind(&self) -> ahf_core::ErrorKind {
        match self {
            ApiError::Auth(_) => ahf_core::ErrorKind::Auth,
            ApiError::Transient { .. } => ahf_core::ErrorKind::Transient,
            ApiError::Permanent { .. } => ahf_core::ErrorKind::Permanent,
            ApiError::Decode { .. } => ahf_core::ErrorKind::SchemaDrift,
        }
    }
}

/// Exponential backoff: `base * multiplier^attempt`, capped, with optional jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Fraction of the computed delay that may be randomly shaved off.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn rate_limited() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = self.multiplier.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let shave = rand::thread_rng().gen_range(0.0..=jitter);
        delay.mul_f64(1.0 - shave)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 100,
            per_hour: 36_000,
        }
    }
}

/// Token bucket that refills one token every `refill_every`, up to `capacity`.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A bucket allowing `quota` requests per `window`.
    pub fn per_window(quota: u32, window: Duration) -> Self {
        let quota = quota.max(1);
        Self::new(quota, window / quota)
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && !self.refill_every.is_zero() {
                let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
                let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
                if state.tokens == self.capacity {
                    state.last_refill = Instant::now();
                }
            } else if self.refill_every.is_zero() {
                state.tokens = self.capacity;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(state.last_refill.elapsed());
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Both published quotas; a request needs a slot in each.
#[derive(Debug)]
pub struct RateLimiter {
    per_second: SimpleTokenBucket,
    per_hour: SimpleTokenBucket,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            per_second: SimpleTokenBucket::per_window(config.per_second, Duration::from_secs(1)),
            per_hour: SimpleTokenBucket::per_window(config.per_hour, Duration::from_secs(3_600)),
        }
    }

    pub async fn acquire(&self) {
        self.per_hour.take().await;
        self.per_second.take().await;
    }
}

#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_EXPIRY_BUFFER < self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone)]
pub struct ApiCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Process-wide state shared by every client: token cache and rate limiter.
#[derive(Debug)]
pub struct ApiContext {
    tokens: Mutex<HashMap<String, AccessToken>>,
    limiter: RateLimiter,
}

impl ApiContext {
    pub fn new(rate_limit: RateLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            tokens: Mutex::new(HashMap::new()),
            limiter: RateLimiter::new(rate_limit),
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub region: Region,
    pub locale: String,
    pub api_base_url: String,
    pub token_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate_limit_backoff: BackoffPolicy,
}

impl ApiConfig {
    pub fn for_region(region: Region) -> Self {
        let locale = match region {
            Region::Us => "en_US",
            Region::Eu => "en_GB",
            Region::Kr => "ko_KR",
            Region::Tw => "zh_TW",
            Region::Cn => "zh_CN",
        };
        Self {
            region,
            locale: locale.to_string(),
            api_base_url: region.api_base_url(),
            token_url: region.token_url().to_string(),
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("ah-feeder/{}", env!("CARGO_PKG_VERSION"))),
            rate_limit_backoff: BackoffPolicy::rate_limited(),
        }
    }
}

/// Opaque position in a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageCursor(CursorPosition);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CursorPosition {
    Start,
    Index(u32),
    Href(String),
}

impl PageCursor {
    pub fn start() -> Self {
        Self(CursorPosition::Start)
    }

    pub fn index(page: u32) -> Self {
        Self(CursorPosition::Index(page))
    }

    pub fn href(url: impl Into<String>) -> Self {
        Self(CursorPosition::Href(url.into()))
    }

    fn from_next(next: NextPage) -> Option<Self> {
        match next {
            NextPage::Done => None,
            NextPage::Index(page) => Some(Self::index(page)),
            NextPage::Href(url) => Some(Self::href(url)),
        }
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            CursorPosition::Start => f.write_str("start"),
            CursorPosition::Index(page) => write!(f, "page {page}"),
            CursorPosition::Href(url) => f.write_str(url),
        }
    }
}

/// One page of raw auction records.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<JsonValue>,
    pub next: Option<PageCursor>,
}

/// The remote auction listing source, as seen by the orchestrator.
#[async_trait]
pub trait AuctionSource: Send + Sync {
    fn region(&self) -> Region;

    async fn authenticate(&self) -> Result<AccessToken, ApiError>;

    async fn fetch_page(&self, realm_id: u32, cursor: &PageCursor) -> Result<Page, ApiError>;

    async fn connected_realm_ids(&self) -> Result<Vec<u32>, ApiError>;

    /// Detail for one connected realm; `None` when upstream no longer knows the id.
    async fn connected_realm(&self, realm_id: u32) -> Result<Option<ConnectedRealm>, ApiError>;
}

/// Lazy, finite, single-use sequence of pages for one realm.
///
/// A failed fetch leaves the cursor in place, so the next call asks for the
/// same page again. Once the last page is yielded the sequence is exhausted.
/// A `next` pointer that repeats an already served cursor, or a listing longer
/// than `max_pages`, ends the sequence with a decode error.
pub struct ListingPages {
    source: Arc<dyn AuctionSource>,
    realm_id: u32,
    cursor: Option<PageCursor>,
    served: HashSet<PageCursor>,
    fetched: usize,
    max_pages: usize,
}

impl ListingPages {
    pub fn new(source: Arc<dyn AuctionSource>, realm_id: u32) -> Self {
        Self {
            source,
            realm_id,
            cursor: Some(PageCursor::start()),
            served: HashSet::new(),
            fetched: 0,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    pub fn pages_fetched(&self) -> usize {
        self.fetched
    }

    pub async fn next_page(&mut self) -> Option<Result<Page, ApiError>> {
        let cursor = self.cursor.clone()?;
        let stop = if self.served.contains(&cursor) {
            Some(format!("next page pointer repeats {cursor} after {} pages", self.fetched))
        } else if self.fetched >= self.max_pages {
            Some(format!("listing exceeds {} pages", self.max_pages))
        } else {
            None
        };
        if let Some(reason) = stop {
            self.cursor = None;
            return Some(Err(ApiError::Decode {
                url: format!("realm {} {cursor}", self.realm_id),
                reason,
            }));
        }

        match self.source.fetch_page(self.realm_id, &cursor).await {
            Ok(page) => {
                self.cursor = page.next.clone();
                self.served.insert(cursor);
                self.fetched += 1;
                Some(Ok(page))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    86_399
}

#[derive(Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
    credentials: ApiCredentials,
    context: Arc<ApiContext>,
}

impl ApiClient {
    pub fn new(
        config: ApiConfig,
        credentials: ApiCredentials,
        context: Arc<ApiContext>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let http = builder.build().context("building reqwest client")?;
        Ok(Self {
            http,
            config,
            credentials,
            context,
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Returns the cached token, fetching a new one when missing or near expiry.
    ///
    /// The cache lock is held across the token request so concurrent pipelines
    /// wait for one refresh instead of each issuing their own.
    pub async fn access_token(&self) -> Result<AccessToken, ApiError> {
        let mut tokens = self.context.tokens.lock().await;
        if let Some(token) = tokens.get(&self.config.token_url) {
            if token.is_fresh() {
                return Ok(token.clone());
            }
        }
        let token = self.request_token().await?;
        tokens.insert(self.config.token_url.clone(), token.clone());
        Ok(token)
    }

    async fn invalidate(&self, rejected: &AccessToken) {
        let mut tokens = self.context.tokens.lock().await;
        if tokens
            .get(&self.config.token_url)
            .is_some_and(|cached| cached.value == rejected.value)
        {
            tokens.remove(&self.config.token_url);
        }
    }

    async fn request_token(&self) -> Result<AccessToken, ApiError> {
        let span = info_span!("oauth_token", region = %self.config.region, url = %self.config.token_url);
        async {
            let resp = self
                .http
                .post(&self.config.token_url)
                .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
                .form(&[("grant_type", "client_credentials")])
                .send()
                .await
                .map_err(|e| ApiError::Auth(format!("token request failed: {e}")))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(ApiError::Auth(format!("token endpoint returned {status}")));
            }
            let body: TokenResponse = resp
                .json()
                .await
                .map_err(|e| ApiError::Auth(format!("invalid token response: {e}")))?;
            debug!(expires_in = body.expires_in, "obtained access token");
            Ok(AccessToken {
                value: body.access_token,
                expires_at: Instant::now() + Duration::from_secs(body.expires_in),
            })
        }
        .instrument(span)
        .await
    }

    fn auctions_url(&self, realm_id: u32) -> String {
        let base = self.config.api_base_url.trim_end_matches('/');
        if realm_id == COMMODITIES_REALM_ID {
            format!("{base}/data/wow/auctions/commodities")
        } else {
            format!("{base}/data/wow/connected-realm/{realm_id}/auctions")
        }
    }

    /// Rate-limited authenticated GET. Handles a single 401 re-auth and the
    /// 429 fallback; every other failure is returned to the caller.
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, ApiError> {
        let mut reauthenticated = false;
        let mut rate_limited = 0usize;
        let backoff = self.config.rate_limit_backoff;

        loop {
            self.context.limiter.acquire().await;
            let token = self.access_token().await?;

            let resp = self
                .http
                .get(url)
                .query(query)
                .bearer_auth(&token.value)
                .send()
                .await;

            let resp = match resp {
                Ok(resp) => resp,
                Err(err) => {
                    return Err(match classify_reqwest_error(&err) {
                        RetryDisposition::Retryable => ApiError::Transient {
                            reason: err.to_string(),
                            status: None,
                        },
                        RetryDisposition::NonRetryable => ApiError::Permanent {
                            status: 0,
                            url: url.to_string(),
                        },
                    });
                }
            };

            let status = resp.status();
            if status.is_success() {
                let bytes = resp.bytes().await.map_err(|e| ApiError::Transient {
                    reason: format!("reading response body: {e}"),
                    status: Some(status.as_u16()),
                })?;
                return serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
            }

            if status == StatusCode::UNAUTHORIZED {
                if reauthenticated {
                    return Err(ApiError::Auth(
                        "access token rejected after re-authentication".to_string(),
                    ));
                }
                warn!(url, "access token rejected, re-authenticating once");
                self.invalidate(&token).await;
                reauthenticated = true;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                if rate_limited >= backoff.max_retries {
                    return Err(ApiError::Transient {
                        reason: format!("rate limited {} times", rate_limited + 1),
                        status: Some(status.as_u16()),
                    });
                }
                let delay = retry_after(&resp)
                    .map(|hinted| hinted.min(backoff.max_delay))
                    .unwrap_or_else(|| backoff.jittered_delay(rate_limited));
                warn!(url, attempt = rate_limited + 1, delay_ms = delay.as_millis() as u64, "rate limited by upstream");
                rate_limited += 1;
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(match classify_status(status) {
                RetryDisposition::Retryable => ApiError::Transient {
                    reason: format!("http status {status}"),
                    status: Some(status.as_u16()),
                },
                RetryDisposition::NonRetryable => ApiError::Permanent {
                    status: status.as_u16(),
                    url: url.to_string(),
                },
            });
        }
    }

    fn base_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("namespace", self.config.region.dynamic_namespace()),
            ("locale", self.config.locale.clone()),
        ]
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl AuctionSource for ApiClient {
    fn region(&self) -> Region {
        self.config.region
    }

    async fn authenticate(&self) -> Result<AccessToken, ApiError> {
        self.access_token().await
    }

    async fn fetch_page(&self, realm_id: u32, cursor: &PageCursor) -> Result<Page, ApiError> {
        let (url, query) = match &cursor.0 {
            CursorPosition::Start => (self.auctions_url(realm_id), self.base_query()),
            CursorPosition::Index(page) => {
                let mut query = self.base_query();
                query.push(("page", page.to_string()));
                (self.auctions_url(realm_id), query)
            }
            // Upstream links already carry namespace and paging parameters.
            CursorPosition::Href(href) if href.contains("namespace=") => (href.clone(), Vec::new()),
            CursorPosition::Href(href) => (href.clone(), self.base_query()),
        };

        let span = info_span!("fetch_page", region = %self.config.region, realm_id, %cursor);
        async {
            let body = self.get_json(&url, &query).await?;
            let raw = parse_page(body).map_err(|e| ApiError::Decode {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            debug!(records = raw.records.len(), "fetched auction page");
            Ok(Page {
                records: raw.records,
                next: PageCursor::from_next(raw.next),
            })
        }
        .instrument(span)
        .await
    }

    async fn connected_realm_ids(&self) -> Result<Vec<u32>, ApiError> {
        let url = format!(
            "{}/data/wow/connected-realm/index",
            self.config.api_base_url.trim_end_matches('/')
        );
        let body = self.get_json(&url, &self.base_query()).await?;
        parse_realm_index(&body).map_err(|e| ApiError::Decode {
            url,
            reason: e.to_string(),
        })
    }

    async fn connected_realm(&self, realm_id: u32) -> Result<Option<ConnectedRealm>, ApiError> {
        let url = format!(
            "{}/data/wow/connected-realm/{realm_id}",
            self.config.api_base_url.trim_end_matches('/')
        );
        let body = match self.get_json(&url, &self.base_query()).await {
            Ok(body) => body,
            Err(ApiError::Permanent { status: 404, .. }) => {
                debug!(realm_id, "connected realm not found, skipping");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        parse_connected_realm(&body)
            .map(Some)
            .map_err(|e| ApiError::Decode {
                url,
                reason: e.to_string(),
            })
    }
}
