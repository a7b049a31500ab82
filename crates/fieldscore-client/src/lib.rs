//! Rate-limited, retrying HTTP client for the upstream observation API.

use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use fieldscore_core::{ConfigError, SyncFilters};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "fieldscore-client";

/// Upstream hard cap on `per_page`.
pub const MAX_PAGE_SIZE: u32 = 200;

const BODY_SNIPPET_MAX: usize = 300;

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

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Exponential delay for a zero-based attempt index, capped at
    /// `max_delay`. Jitter is applied separately at sleep time so this
    /// stays deterministic and testable.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Adds up to +50% random jitter so synchronized clients do not retry in
/// lockstep.
pub fn jittered(delay: Duration) -> Duration {
    let extra_millis = delay.as_millis() as u64 / 2;
    if extra_millis == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=extra_millis))
}

/// Global pacing budget: every upstream request waits until at least
/// `min_interval` has passed since the previous one. The reconciliation
/// fallback re-fetch shares this pacer with the primary sync fetch.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub page_size: u32,
    pub pacing_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.inaturalist.org/v1".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            page_size: MAX_PAGE_SIZE,
            pacing_interval: Duration::from_millis(1_100),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::new(format!(
                "page_size must be in 1..={MAX_PAGE_SIZE}"
            )));
        }
        if self.base_url.is_empty() {
            return Err(ConfigError::new("base_url is empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body_snippet}")]
    Status {
        status: u16,
        url: String,
        body_snippet: String,
    },
    #[error("retries exhausted after {attempts} attempts for {url} (last status {last_status})")]
    RetriesExhausted {
        attempts: usize,
        last_status: u16,
        url: String,
    },
    #[error("unexpected response shape for {url}: {detail}")]
    Shape { url: String, detail: String },
}

/// Parse a `Retry-After` header carrying either delta-seconds or an
/// HTTP-date.
fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

fn truncate_body(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_MAX).collect()
}

/// Paced, retrying client for the paginated observation endpoints.
#[derive(Debug)]
pub struct ObservationClient {
    http: reqwest::Client,
    base_url: String,
    page_size: u32,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl ObservationClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        config.validate()?;
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
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            pacer: RequestPacer::new(config.pacing_interval),
            backoff: config.backoff,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// One paced GET with the shared retry policy. 429/5xx and transport
    /// timeouts retry with jittered exponential backoff, honoring a
    /// server `Retry-After` hint when it exceeds the computed delay. Any
    /// other non-success status fails fast with the truncated body.
    async fn get_results(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<JsonValue>, FetchError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut last_status = 0u16;

        for attempt in 0..=self.backoff.max_retries {
            self.pacer.pace().await;

            let resp = match self.http.get(&url).query(query).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = jittered(self.backoff.delay_for_attempt(attempt));
                        warn!(%url, attempt, error = %err, "transport error, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            };

            let status = resp.status();
            if status.is_success() {
                let final_url = resp.url().to_string();
                let body: JsonValue = resp.json().await?;
                return body
                    .get("results")
                    .and_then(JsonValue::as_array)
                    .map(|rows| rows.to_vec())
                    .ok_or(FetchError::Shape {
                        url: final_url,
                        detail: "missing results array".to_string(),
                    });
            }

            if classify_status(status) == RetryDisposition::NonRetryable {
                let final_url = resp.url().to_string();
                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url: final_url,
                    body_snippet: truncate_body(&body),
                });
            }

            last_status = status.as_u16();
            if attempt < self.backoff.max_retries {
                let backoff = jittered(self.backoff.delay_for_attempt(attempt));
                let delay = match retry_after_hint(resp.headers()) {
                    Some(hint) => backoff.max(hint),
                    None => backoff,
                };
                warn!(%url, attempt, status = last_status, delay_ms = delay.as_millis() as u64, "retryable status, backing off");
                tokio::time::sleep(delay).await;
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts: self.backoff.max_retries + 1,
            last_status,
            url,
        })
    }

    /// Fetch one page of observations, ascending by `updated_at`.
    pub async fn observations_page(
        &self,
        filters: &SyncFilters,
        since: DateTime<Utc>,
        page: u32,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("order", "asc".to_string()),
            ("order_by", "updated_at".to_string()),
            ("page", page.to_string()),
            ("per_page", self.page_size.to_string()),
            (
                "updated_since",
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ];
        if let Some(start) = filters.date_start {
            query.push(("d1", start.to_string()));
        }
        if let Some(end) = filters.date_end {
            query.push(("d2", end.to_string()));
        }
        if let Some(bbox) = &filters.bounding_box {
            query.push(("nelat", bbox.nelat.to_string()));
            query.push(("nelng", bbox.nelng.to_string()));
            query.push(("swlat", bbox.swlat.to_string()));
            query.push(("swlng", bbox.swlng.to_string()));
        }
        if !filters.observer_logins.is_empty() {
            query.push(("user_login", filters.observer_logins.join(",")));
        }
        debug!(page, "fetching observation page");
        self.get_results("observations", &query).await
    }

    /// Explicit deletion feed: ids removed upstream since `since`.
    pub async fn deleted_ids(&self, since: DateTime<Utc>) -> Result<Vec<i64>, FetchError> {
        let query = vec![(
            "since",
            since.to_rfc3339_opts(SecondsFormat::Secs, true),
        )];
        let rows = self.get_results("observations/deleted", &query).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("id").and_then(JsonValue::as_i64))
            .collect())
    }

    pub fn pages<'a>(
        &'a self,
        filters: &'a SyncFilters,
        since: DateTime<Utc>,
    ) -> ObservationPager<'a> {
        ObservationPager {
            client: self,
            filters,
            since,
            next_page: 1,
            done: false,
        }
    }
}

/// Lazy, restartable page sequence. Pagination terminates when a page
/// comes back empty or shorter than the page size.
pub struct ObservationPager<'a> {
    client: &'a ObservationClient,
    filters: &'a SyncFilters,
    since: DateTime<Utc>,
    next_page: u32,
    done: bool,
}

impl ObservationPager<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<JsonValue>>, FetchError> {
        if self.done {
            return Ok(None);
        }
        let rows = self
            .client
            .observations_page(self.filters, self.since, self.next_page)
            .await?;
        self.next_page += 1;
        if rows.len() < self.client.page_size() as usize {
            self.done = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String, page_size: u32) -> ClientConfig {
        ClientConfig {
            base_url,
            page_size,
            pacing_interval: Duration::from_millis(0),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        }
    }

    fn results_body(ids: &[i64]) -> serde_json::Value {
        serde_json::json!({
            "results": ids
                .iter()
                .map(|id| serde_json::json!({"id": id}))
                .collect::<Vec<_>>()
        })
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_extra() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let delay = jittered(base);
            assert!(delay >= base);
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn retry_after_parses_seconds_and_http_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(retry_after_hint(&headers), Some(Duration::from_secs(120)));

        let when = SystemTime::now() + Duration::from_secs(120);
        headers.insert(RETRY_AFTER, httpdate::fmt_http_date(when).parse().unwrap());
        let hint = retry_after_hint(&headers).expect("http-date parses");
        assert!(hint > Duration::from_secs(110));
        assert!(hint <= Duration::from_secs(120));

        headers.insert(RETRY_AFTER, "soonish".parse().unwrap());
        assert_eq!(retry_after_hint(&headers), None);
    }

    #[test]
    fn config_rejects_oversized_page() {
        let mut config = ClientConfig::default();
        config.page_size = MAX_PAGE_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn pagination_stops_on_short_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/observations"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body(&[1, 2])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/observations"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body(&[3])))
            .expect(1)
            .mount(&server)
            .await;

        let client = ObservationClient::new(test_config(server.uri(), 2)).expect("client");
        let filters = SyncFilters::default();
        let mut pager = client.pages(&filters, DateTime::UNIX_EPOCH);

        let first = pager.next_page().await.expect("page 1");
        assert_eq!(first.map(|rows| rows.len()), Some(2));
        let second = pager.next_page().await.expect("page 2");
        assert_eq!(second.map(|rows| rows.len()), Some(1));
        assert!(pager.next_page().await.expect("end").is_none());
    }

    #[tokio::test]
    async fn empty_first_page_ends_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/observations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body(&[])))
            .expect(1)
            .mount(&server)
            .await;

        let client = ObservationClient::new(test_config(server.uri(), 2)).expect("client");
        let filters = SyncFilters::default();
        let mut pager = client.pages(&filters, DateTime::UNIX_EPOCH);
        assert!(pager.next_page().await.expect("page").is_none());
        assert!(pager.next_page().await.expect("after end").is_none());
    }

    #[tokio::test]
    async fn rate_limited_request_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/observations"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", "0"),
            )
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/observations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body(&[7])))
            .expect(1)
            .mount(&server)
            .await;

        let client = ObservationClient::new(test_config(server.uri(), 2)).expect("client");
        let filters = SyncFilters::default();
        let rows = client
            .observations_page(&filters, DateTime::UNIX_EPOCH, 1)
            .await
            .expect("eventual success");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn retry_after_hint_outranks_the_computed_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/observations"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/observations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body(&[7])))
            .expect(1)
            .mount(&server)
            .await;

        // Backoff alone would sleep single-digit milliseconds here; only
        // honoring the server hint gets the wait past a full second.
        let client = ObservationClient::new(test_config(server.uri(), 2)).expect("client");
        let filters = SyncFilters::default();
        let started = Instant::now();
        let rows = client
            .observations_page(&filters, DateTime::UNIX_EPOCH, 1)
            .await
            .expect("eventual success");
        assert_eq!(rows.len(), 1);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn client_error_fails_fast_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/observations"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden zone"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ObservationClient::new(test_config(server.uri(), 2)).expect("client");
        let filters = SyncFilters::default();
        let err = client
            .observations_page(&filters, DateTime::UNIX_EPOCH, 1)
            .await
            .expect_err("terminal status");
        match err {
            FetchError::Status {
                status,
                body_snippet,
                ..
            } => {
                assert_eq!(status, 403);
                assert_eq!(body_snippet, "forbidden zone");
            }
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_become_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/observations"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = ObservationClient::new(test_config(server.uri(), 2)).expect("client");
        let filters = SyncFilters::default();
        let err = client
            .observations_page(&filters, DateTime::UNIX_EPOCH, 1)
            .await
            .expect_err("retries exhausted");
        match err {
            FetchError::RetriesExhausted {
                attempts,
                last_status,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_status, 503);
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deletion_feed_extracts_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/observations/deleted"))
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body(&[11, 12])))
            .mount(&server)
            .await;

        let client = ObservationClient::new(test_config(server.uri(), 2)).expect("client");
        let ids = client.deleted_ids(DateTime::UNIX_EPOCH).await.expect("ids");
        assert_eq!(ids, vec![11, 12]);
    }
}
