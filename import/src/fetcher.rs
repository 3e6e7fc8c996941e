//! Byte-range fetching of large remote resources.
//!
//! A resource is pulled in fixed-size windows via `Range` requests, so a
//! multi-gigabyte source never has to fit in memory and an interrupted
//! job can resume at any window boundary. Servers that ignore ranges
//! (plain 200) degrade to a single whole-resource window; 416 past the
//! end is a clean end-of-stream. Transient failures (429, 5xx, network)
//! are retried with exponential backoff before the job is failed.
//!
//! The HTTP client is a trait so tests drive the fetcher against an
//! in-memory resource.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, instrument, warn};

/// Sentinel for "total size not known yet" in the cached atomic.
const TOTAL_UNKNOWN: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch failed with status {status}")]
    Fatal { status: u16 },
    #[error("retries exhausted: {0}")]
    Exhausted(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("i/o error reading response body: {0}")]
    Io(String),
}

/// Network-level failure surfaced by an [HttpClient].
#[derive(Debug, Error)]
#[error("http client error: {0}")]
pub struct HttpClientError(pub String);

/// A response, headers surfaced verbatim and the body as a byte stream.
pub struct HttpResponse {
    pub status: u16,
    pub content_range: Option<String>,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
}

/// The HTTP collaborator: plain GET with an optional inclusive byte
/// range, plus HEAD.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<HttpResponse, HttpClientError>;

    async fn head(&self, url: &str) -> Result<HttpResponse, HttpClientError>;
}

/// Production [HttpClient] backed by reqwest.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

fn surface(resp: reqwest::Response) -> HttpResponse {
    let status = resp.status().as_u16();
    let content_range = resp
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_length = resp
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    HttpResponse {
        status,
        content_range,
        content_length,
        body: resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
            .boxed(),
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<HttpResponse, HttpClientError> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            request = request.header("range", format!("bytes={}-{}", start, end));
        }
        let resp = request
            .send()
            .await
            .map_err(|e| HttpClientError(e.without_url().to_string()))?;
        Ok(surface(resp))
    }

    async fn head(&self, url: &str) -> Result<HttpResponse, HttpClientError> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| HttpClientError(e.without_url().to_string()))?;
        Ok(surface(resp))
    }
}

/// A parsed `Content-Range: bytes s-e/total` header. `total` is [None]
/// for the `*` form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.strip_prefix("bytes ")?;
        let (range, total) = rest.split_once('/')?;
        let total = match total {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        let (start, end) = range.split_once('-')?;
        Some(Self {
            start: start.parse().ok()?,
            end: end.parse().ok()?,
            total,
        })
    }

    /// The total of the `bytes */total` form carried by 416 responses.
    fn parse_unsatisfied(header: &str) -> Option<u64> {
        header.strip_prefix("bytes */")?.parse().ok()
    }
}

/// One fetched window of the resource. `end` is inclusive.
#[derive(Debug)]
pub struct FetchedWindow {
    pub data: Bytes,
    pub start: u64,
    pub end: u64,
    pub total_size: Option<u64>,
    pub is_last: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
pub struct RangeFetcherConfig {
    /// Bytes requested per window.
    pub window_size: u64,
    /// Attempts per window, including the first.
    pub max_attempts: usize,
    /// First retry delay; doubles per attempt.
    pub backoff_base_ms: u64,
}

impl Default for RangeFetcherConfig {
    fn default() -> Self {
        Self {
            window_size: 10 * 1024 * 1024,
            max_attempts: 3,
            backoff_base_ms: 1000,
        }
    }
}

/// Distinguishes what the retry loop may try again from what it must
/// surface immediately.
#[derive(Debug)]
enum AttemptError {
    Transient(String),
    Permanent(FetchError),
}

pub struct RangeFetcher {
    client: Arc<dyn HttpClient>,
    config: RangeFetcherConfig,
    /// Cached resource size; [TOTAL_UNKNOWN] until the first response
    /// reveals it.
    total: AtomicU64,
}

impl RangeFetcher {
    pub fn new(client: Arc<dyn HttpClient>, config: RangeFetcherConfig) -> Self {
        Self {
            client,
            config,
            total: AtomicU64::new(TOTAL_UNKNOWN),
        }
    }

    fn cached_total(&self) -> Option<u64> {
        match self.total.load(Ordering::Relaxed) {
            TOTAL_UNKNOWN => None,
            total => Some(total),
        }
    }

    fn cache_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// The resource size, from a HEAD request or, for servers that don't
    /// answer HEAD with a length, a one-byte range request.
    #[instrument(skip(self), err)]
    pub async fn total_size(&self, url: &str) -> Result<Option<u64>, FetchError> {
        if let Some(total) = self.cached_total() {
            return Ok(Some(total));
        }

        if let Ok(resp) = self.client.head(url).await {
            if resp.status == 200 {
                if let Some(len) = resp.content_length {
                    self.cache_total(len);
                    return Ok(Some(len));
                }
            }
        }

        // Fall back to asking for a single byte.
        let resp = self
            .client
            .get(url, Some((0, 0)))
            .await
            .map_err(|e| FetchError::Exhausted(e.to_string()))?;
        let total = resp
            .content_range
            .as_deref()
            .and_then(ContentRange::parse)
            .and_then(|cr| cr.total);
        if let Some(total) = total {
            self.cache_total(total);
        }
        Ok(total)
    }

    /// Fetches the window starting at `start`. [None] means the offset
    /// is at or past the end of the resource.
    #[instrument(skip(self), fields(window_size = self.config.window_size), err)]
    pub async fn fetch_window(
        &self,
        url: &str,
        start: u64,
    ) -> Result<Option<FetchedWindow>, FetchError> {
        if let Some(total) = self.cached_total() {
            if start >= total {
                return Ok(None);
            }
        }

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.config.backoff_base_ms / 2)
            .take(self.config.max_attempts.saturating_sub(1));

        let result = RetryIf::spawn(
            strategy,
            || self.attempt_window(url, start),
            |e: &AttemptError| {
                if let AttemptError::Transient(reason) = e {
                    warn!(%reason, "transient fetch failure, backing off");
                    true
                } else {
                    false
                }
            },
        )
        .await;

        match result {
            Ok(window) => Ok(window),
            Err(AttemptError::Transient(reason)) => Err(FetchError::Exhausted(reason)),
            Err(AttemptError::Permanent(e)) => Err(e),
        }
    }

    async fn attempt_window(
        &self,
        url: &str,
        start: u64,
    ) -> Result<Option<FetchedWindow>, AttemptError> {
        let end_requested = start + self.config.window_size - 1;
        let resp = self
            .client
            .get(url, Some((start, end_requested)))
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        match resp.status {
            206 => {
                let content_range = resp
                    .content_range
                    .as_deref()
                    .and_then(ContentRange::parse)
                    .ok_or_else(|| {
                        AttemptError::Permanent(FetchError::Protocol(
                            "206 without a parseable Content-Range".to_string(),
                        ))
                    })?;
                let data = collect_body(resp.body)
                    .await
                    .map_err(|e| AttemptError::Transient(e.to_string()))?;

                if let Some(total) = content_range.total {
                    self.cache_total(total);
                }
                let is_last = match content_range.total {
                    Some(total) => content_range.end + 1 >= total,
                    // Without a total, a short window is the only signal.
                    None => (data.len() as u64) < self.config.window_size,
                };
                debug!(
                    start = content_range.start,
                    end = content_range.end,
                    total = ?content_range.total,
                    is_last,
                    "fetched window"
                );
                Ok(Some(FetchedWindow {
                    data,
                    start: content_range.start,
                    end: content_range.end,
                    total_size: content_range.total,
                    is_last,
                }))
            }
            200 => {
                // Server ignored the range and sent the whole resource.
                let data = collect_body(resp.body)
                    .await
                    .map_err(|e| AttemptError::Transient(e.to_string()))?;
                let total = data.len() as u64;
                self.cache_total(total);
                if start >= total {
                    return Ok(None);
                }
                Ok(Some(FetchedWindow {
                    data: data.slice(start as usize..),
                    start,
                    end: total - 1,
                    total_size: Some(total),
                    is_last: true,
                }))
            }
            416 => {
                if let Some(total) = resp
                    .content_range
                    .as_deref()
                    .and_then(ContentRange::parse_unsatisfied)
                {
                    self.cache_total(total);
                }
                Ok(None)
            }
            status @ (429 | 500..=599) => Err(AttemptError::Transient(format!(
                "server answered {}",
                status
            ))),
            status => Err(AttemptError::Permanent(FetchError::Fatal { status })),
        }
    }

    /// Lazy sequence of windows from `start_offset` to the end of the
    /// resource.
    pub fn chunks<'a>(
        &'a self,
        url: &'a str,
        start_offset: u64,
    ) -> BoxStream<'a, Result<FetchedWindow, FetchError>> {
        async_stream::try_stream! {
            let mut start = start_offset;
            loop {
                match self.fetch_window(url, start).await? {
                    None => break,
                    Some(window) => {
                        start = window.end + 1;
                        let is_last = window.is_last;
                        yield window;
                        if is_last {
                            break;
                        }
                    }
                }
            }
        }
        .boxed()
    }
}

async fn collect_body(
    body: BoxStream<'static, std::io::Result<Bytes>>,
) -> Result<Bytes, std::io::Error> {
    let mut out = BytesMut::new();
    let mut body = body;
    while let Some(chunk) = body.try_next().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use test_case::test_case;

    use crate::testing::FakeHttpClient;

    use super::*;

    fn fetcher(client: FakeHttpClient, window_size: u64) -> RangeFetcher {
        RangeFetcher::new(
            Arc::new(client),
            RangeFetcherConfig {
                window_size,
                max_attempts: 3,
                backoff_base_ms: 2,
            },
        )
    }

    #[test_case("bytes 0-299999/1000000", Some(ContentRange { start: 0, end: 299_999, total: Some(1_000_000) }); "with total")]
    #[test_case("bytes 5-9/*", Some(ContentRange { start: 5, end: 9, total: None }); "unknown total")]
    #[test_case("bytes 0-1", None; "missing total")]
    #[test_case("items 0-1/2", None; "wrong unit")]
    #[test_case("bytes x-1/2", None; "garbage")]
    fn content_range_parsing(header: &str, expected: Option<ContentRange>) {
        assert_eq!(expected, ContentRange::parse(header));
    }

    #[tokio::test]
    async fn windows_cover_the_resource_exactly() {
        let resource: Vec<u8> = (0..1_000_000u32).map(|i| i as u8).collect();
        let fetcher = fetcher(FakeHttpClient::new(resource.clone()), 300_000);

        let windows: Vec<FetchedWindow> = fetcher
            .chunks("https://example.com/data", 0)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(4, windows.len());
        assert_eq!((0, 299_999, false), (windows[0].start, windows[0].end, windows[0].is_last));
        assert_eq!((300_000, 599_999, false), (windows[1].start, windows[1].end, windows[1].is_last));
        assert_eq!((600_000, 899_999, false), (windows[2].start, windows[2].end, windows[2].is_last));
        assert_eq!((900_000, 999_999, true), (windows[3].start, windows[3].end, windows[3].is_last));

        let reassembled: Vec<u8> = windows.iter().flat_map(|w| w.data.to_vec()).collect();
        assert_eq!(resource, reassembled);
        assert_eq!(Some(1_000_000), windows[0].total_size);
    }

    #[tokio::test]
    async fn offset_past_the_end_is_end_of_stream() {
        let fetcher = fetcher(FakeHttpClient::new(vec![0u8; 1_000_000]), 300_000);
        let window = fetcher
            .fetch_window("https://example.com/data", 1_000_000)
            .await
            .unwrap();
        assert!(window.is_none());

        let windows: Vec<FetchedWindow> = fetcher
            .chunks("https://example.com/data", 1_000_000)
            .try_collect()
            .await
            .unwrap();
        assert!(windows.is_empty());
    }

    #[tokio::test]
    async fn resuming_mid_resource_starts_at_the_offset() {
        let resource: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let fetcher = fetcher(FakeHttpClient::new(resource.clone()), 400);

        let windows: Vec<FetchedWindow> = fetcher
            .chunks("https://example.com/data", 600)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(1, windows.len());
        assert_eq!(600, windows[0].start);
        assert_eq!(&resource[600..], &windows[0].data[..]);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let client = FakeHttpClient::new(vec![1u8; 100]).failing_with(vec![503, 429]);
        let fetcher = fetcher(client, 1000);

        let window = fetcher
            .fetch_window("https://example.com/data", 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(100, window.data.len());
        assert!(window.is_last);
    }

    #[tokio::test]
    async fn retries_exhaust_into_an_error() {
        let client = FakeHttpClient::new(vec![1u8; 100]).failing_with(vec![503, 503, 503, 503]);
        let fetcher = fetcher(client, 1000);
        assert!(matches!(
            fetcher.fetch_window("https://example.com/data", 0).await,
            Err(FetchError::Exhausted(_))
        ));
    }

    #[tokio::test]
    async fn client_errors_are_fatal_immediately() {
        let client = FakeHttpClient::new(vec![1u8; 100]).failing_with(vec![404]);
        let fetcher = fetcher(client, 1000);
        assert!(matches!(
            fetcher.fetch_window("https://example.com/data", 0).await,
            Err(FetchError::Fatal { status: 404 })
        ));
    }

    #[tokio::test]
    async fn range_ignoring_server_yields_one_window() {
        let resource = vec![7u8; 5000];
        let client = FakeHttpClient::new(resource.clone()).ignoring_ranges();
        let fetcher = fetcher(client, 1000);

        let windows: Vec<FetchedWindow> = fetcher
            .chunks("https://example.com/data", 0)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(1, windows.len());
        assert!(windows[0].is_last);
        assert_eq!(5000, windows[0].data.len());
    }

    #[tokio::test]
    async fn total_size_prefers_head() {
        let client = FakeHttpClient::new(vec![0u8; 1234]);
        let fetcher = fetcher(client, 1000);
        assert_eq!(
            Some(1234),
            fetcher.total_size("https://example.com/data").await.unwrap()
        );
    }

    #[tokio::test]
    async fn total_size_falls_back_to_a_range_probe() {
        let client = FakeHttpClient::new(vec![0u8; 1234]).without_head();
        let fetcher = fetcher(client, 1000);
        assert_eq!(
            Some(1234),
            fetcher.total_size("https://example.com/data").await.unwrap()
        );
    }
}
