// ============================================================================
// Network Fetching
// ============================================================================
//
// Every outbound request goes through `HttpFetcher`: bounded timeout, a fixed
// number of retries with doubling backoff, and a payload cap. Feed payloads
// reach the pipeline through the `FeedSource` trait so cycles can be driven
// without a network in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use tracing::{debug, error, warn};

use crate::config::{FeedConfig, FetchConfig};
use crate::error::FetchError;
use crate::models::FeedKind;

const USER_AGENT: &str = concat!("transit_pipeline/", env!("CARGO_PKG_VERSION"));

/// Cache validators remembered from a previous response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ConditionalHeaders {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    NotModified,
    Fetched { body: Bytes, validators: ConditionalHeaders },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::NetworkFailure {
                url: String::new(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// GETs `url`, retrying transient failures. Client errors (4xx) and
    /// oversize payloads are not retried.
    pub async fn fetch(
        &self,
        url: &str,
        conditional: Option<&ConditionalHeaders>,
        max_bytes: usize,
    ) -> Result<FetchOutcome, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url, conditional, max_bytes).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.config.max_retries && is_retryable(&e) => {
                    attempt += 1;
                    let delay = self.config.backoff(attempt);
                    warn!(url, attempt, delay_ms = delay.as_millis() as u64, "Fetch failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(url, attempts = attempt + 1, "Fetch failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Plain GET returning the body, for feed payloads.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        match self.fetch(url, None, self.config.max_payload_bytes).await? {
            FetchOutcome::Fetched { body, .. } => Ok(body),
            // only possible when validators were sent
            FetchOutcome::NotModified => Ok(Bytes::new()),
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        conditional: Option<&ConditionalHeaders>,
        max_bytes: usize,
    ) -> Result<FetchOutcome, FetchError> {
        let network = |e: reqwest::Error| FetchError::NetworkFailure {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let mut request = self.client.get(url);
        if let Some(headers) = conditional {
            if let Some(etag) = &headers.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &headers.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await.map_err(network)?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(url, "Upstream not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(length) = response.content_length() {
            if length as usize > max_bytes {
                return Err(FetchError::PayloadTooLarge {
                    url: url.to_string(),
                    size: length as usize,
                    max: max_bytes,
                });
            }
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let validators = ConditionalHeaders {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        };

        let body = response.bytes().await.map_err(network)?;
        if body.len() > max_bytes {
            return Err(FetchError::PayloadTooLarge {
                url: url.to_string(),
                size: body.len(),
                max: max_bytes,
            });
        }

        Ok(FetchOutcome::Fetched { body, validators })
    }
}

fn is_retryable(error: &FetchError) -> bool {
    match error {
        FetchError::NetworkFailure { .. } => true,
        FetchError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
        FetchError::PayloadTooLarge { .. } => false,
    }
}

// ============================================================================
// Feed Sources
// ============================================================================

/// Supplies the raw payload for one feed kind.
pub trait FeedSource: Send + Sync {
    fn fetch(&self, kind: FeedKind) -> BoxFuture<'_, Result<Bytes, FetchError>>;
}

/// Fetches both feeds from their configured URLs.
pub struct HttpFeedSource {
    fetcher: HttpFetcher,
    feeds: FeedConfig,
}

impl HttpFeedSource {
    pub fn new(fetcher: HttpFetcher, feeds: FeedConfig) -> Self {
        Self { fetcher, feeds }
    }

    fn url(&self, kind: FeedKind) -> &str {
        match kind {
            FeedKind::VehiclePositions => &self.feeds.vehicle_positions_url,
            FeedKind::TripUpdates => &self.feeds.trip_updates_url,
        }
    }
}

impl FeedSource for HttpFeedSource {
    fn fetch(&self, kind: FeedKind) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move { self.fetcher.fetch_bytes(self.url(kind)).await })
    }
}

/// Serves canned payloads. Kinds without a payload fail like an unreachable host.
#[derive(Default)]
pub struct StaticFeedSource {
    payloads: Mutex<HashMap<FeedKind, Vec<u8>>>,
    delay: Option<std::time::Duration>,
}

impl StaticFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(self, kind: FeedKind, payload: Vec<u8>) -> Self {
        self.set_payload(kind, payload);
        self
    }

    /// Delays every fetch, for exercising cycle timeouts.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_payload(&self, kind: FeedKind, payload: Vec<u8>) {
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.insert(kind, payload);
        }
    }
}

impl FeedSource for StaticFeedSource {
    fn fetch(&self, kind: FeedKind) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let payload = self
                .payloads
                .lock()
                .ok()
                .and_then(|payloads| payloads.get(&kind).cloned());
            payload.map(Bytes::from).ok_or_else(|| FetchError::NetworkFailure {
                url: format!("static://{}", kind),
                reason: "no payload configured".to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedResponse, ScriptedServer};

    fn fetcher_with_retries(max_retries: u32) -> HttpFetcher {
        HttpFetcher::new(FetchConfig {
            timeout_secs: 5,
            max_retries,
            initial_backoff_ms: 1,
            ..FetchConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn server_errors_are_retried_client_errors_are_not() {
        let server = FetchError::HttpStatus { url: "u".into(), status: 503 };
        let client = FetchError::HttpStatus { url: "u".into(), status: 404 };
        let throttled = FetchError::HttpStatus { url: "u".into(), status: 429 };
        assert!(is_retryable(&server));
        assert!(!is_retryable(&client));
        assert!(is_retryable(&throttled));
        assert!(!is_retryable(&FetchError::PayloadTooLarge { url: "u".into(), size: 2, max: 1 }));
    }

    #[tokio::test]
    async fn static_source_serves_configured_kinds() {
        let source = StaticFeedSource::new().with_payload(FeedKind::TripUpdates, vec![1, 2, 3]);
        let body = source.fetch(FeedKind::TripUpdates).await.unwrap();
        assert_eq!(&body[..], &[1, 2, 3]);
        assert!(matches!(
            source.fetch(FeedKind::VehiclePositions).await,
            Err(FetchError::NetworkFailure { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_host_fails_after_retries() {
        let config = FetchConfig {
            timeout_secs: 1,
            max_retries: 1,
            initial_backoff_ms: 1,
            ..FetchConfig::default()
        };
        let fetcher = HttpFetcher::new(config).unwrap();
        let result = fetcher.fetch_bytes("http://127.0.0.1:9/feed.pb").await;
        assert!(matches!(result, Err(FetchError::NetworkFailure { .. })));
    }

    #[actix_web::test]
    async fn server_errors_are_retried_until_success() {
        let upstream = ScriptedServer::start(vec![
            ScriptedResponse::new(503, ""),
            ScriptedResponse::new(502, ""),
            ScriptedResponse::new(200, "feed"),
        ]);

        let body = fetcher_with_retries(3).fetch_bytes(&upstream.url).await.unwrap();
        assert_eq!(&body[..], b"feed");
        assert_eq!(upstream.hits(), 3);
        upstream.stop().await;
    }

    #[actix_web::test]
    async fn retries_stop_at_the_configured_limit() {
        let upstream = ScriptedServer::start(vec![ScriptedResponse::new(503, "")]);

        let result = fetcher_with_retries(2).fetch_bytes(&upstream.url).await;
        assert!(matches!(result, Err(FetchError::HttpStatus { status: 503, .. })));
        assert_eq!(upstream.hits(), 3);
        upstream.stop().await;
    }

    #[actix_web::test]
    async fn client_errors_fail_on_first_attempt() {
        let upstream = ScriptedServer::start(vec![ScriptedResponse::new(404, "")]);

        let result = fetcher_with_retries(3).fetch_bytes(&upstream.url).await;
        assert!(matches!(result, Err(FetchError::HttpStatus { status: 404, .. })));
        assert_eq!(upstream.hits(), 1);
        upstream.stop().await;
    }

    #[actix_web::test]
    async fn validators_round_trip_into_not_modified() {
        let upstream = ScriptedServer::start(vec![
            ScriptedResponse::new(200, "archive").with_etag("\"v1\""),
            ScriptedResponse::new(304, ""),
        ]);
        let fetcher = fetcher_with_retries(0);

        let validators = match fetcher.fetch(&upstream.url, None, 1024).await.unwrap() {
            FetchOutcome::Fetched { body, validators } => {
                assert_eq!(&body[..], b"archive");
                validators
            }
            FetchOutcome::NotModified => panic!("first request has no validators"),
        };
        assert_eq!(validators.etag.as_deref(), Some("\"v1\""));

        let second = fetcher.fetch(&upstream.url, Some(&validators), 1024).await.unwrap();
        assert!(matches!(second, FetchOutcome::NotModified));
        assert_eq!(upstream.if_none_match(), vec![None, Some("\"v1\"".to_string())]);
        upstream.stop().await;
    }

    #[actix_web::test]
    async fn oversize_body_is_rejected_without_retry() {
        let upstream = ScriptedServer::start(vec![ScriptedResponse::new(200, vec![0u8; 64])]);

        let result = fetcher_with_retries(3).fetch(&upstream.url, None, 16).await;
        assert!(matches!(result, Err(FetchError::PayloadTooLarge { size: 64, max: 16, .. })));
        assert_eq!(upstream.hits(), 1);
        upstream.stop().await;
    }
}
