//! An in-memory [HttpClient] serving one resource, with scriptable
//! failures. Test-only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::stream::BoxStream;

use crate::fetcher::{HttpClient, HttpClientError, HttpResponse};

pub(crate) struct FakeHttpClient {
    data: Bytes,
    /// Statuses to answer with (in order) once `fail_from` requests have
    /// been served.
    scripted_failures: Mutex<VecDeque<u16>>,
    fail_from: usize,
    /// Break the response body with an I/O error after this many bytes.
    body_error_after: Option<usize>,
    /// Pretend the server doesn't implement range requests.
    ignore_ranges: bool,
    /// Pretend HEAD is not supported (405, no length).
    no_head: bool,
    requests: AtomicUsize,
}

impl FakeHttpClient {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            scripted_failures: Mutex::new(VecDeque::new()),
            fail_from: 0,
            body_error_after: None,
            ignore_ranges: false,
            no_head: false,
            requests: AtomicUsize::new(0),
        }
    }

    /// Answers the given statuses (in order) before behaving normally.
    pub fn failing_with(self, statuses: Vec<u16>) -> Self {
        self.failing_from(0, statuses)
    }

    /// Like [FakeHttpClient::failing_with], but only once `from` GET
    /// requests have been served normally.
    pub fn failing_from(self, from: usize, statuses: Vec<u16>) -> Self {
        *self.scripted_failures.lock().unwrap() = statuses.into();
        Self {
            fail_from: from,
            ..self
        }
    }

    /// Serve bodies that break with an I/O error after `bytes` bytes.
    pub fn erroring_body_after(mut self, bytes: usize) -> Self {
        self.body_error_after = Some(bytes);
        self
    }

    pub fn ignoring_ranges(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    pub fn without_head(mut self) -> Self {
        self.no_head = true;
        self
    }

    fn body(&self, data: Bytes) -> BoxStream<'static, std::io::Result<Bytes>> {
        if let Some(cut) = self.body_error_after {
            if cut < data.len() {
                return Box::pin(stream::iter(vec![
                    Ok(data.slice(..cut)),
                    Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection reset mid-body",
                    )),
                ]));
            }
        }
        // Serve in two chunks so body streaming is exercised.
        let mid = data.len() / 2;
        Box::pin(stream::iter(
            vec![data.slice(..mid), data.slice(mid..)]
                .into_iter()
                .filter(|c| !c.is_empty())
                .map(Ok),
        ))
    }

    fn empty_body() -> BoxStream<'static, std::io::Result<Bytes>> {
        Box::pin(stream::empty())
    }
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn get(
        &self,
        _url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<HttpResponse, HttpClientError> {
        let served = self.requests.fetch_add(1, Ordering::Relaxed);

        if served >= self.fail_from {
            if let Some(status) = self.scripted_failures.lock().unwrap().pop_front() {
                return Ok(HttpResponse {
                    status,
                    content_range: None,
                    content_length: None,
                    body: Self::empty_body(),
                });
            }
        }

        let len = self.data.len() as u64;
        match range {
            Some((start, end)) if !self.ignore_ranges => {
                if start >= len {
                    return Ok(HttpResponse {
                        status: 416,
                        content_range: Some(format!("bytes */{}", len)),
                        content_length: None,
                        body: Self::empty_body(),
                    });
                }
                let end = end.min(len - 1);
                let slice = self.data.slice(start as usize..=end as usize);
                Ok(HttpResponse {
                    status: 206,
                    content_range: Some(format!("bytes {}-{}/{}", start, end, len)),
                    content_length: Some(slice.len() as u64),
                    body: self.body(slice),
                })
            }
            _ => Ok(HttpResponse {
                status: 200,
                content_range: None,
                content_length: Some(len),
                body: self.body(self.data.clone()),
            }),
        }
    }

    async fn head(&self, _url: &str) -> Result<HttpResponse, HttpClientError> {
        if self.no_head {
            return Ok(HttpResponse {
                status: 405,
                content_range: None,
                content_length: None,
                body: Self::empty_body(),
            });
        }
        Ok(HttpResponse {
            status: 200,
            content_range: None,
            content_length: Some(self.data.len() as u64),
            body: Self::empty_body(),
        })
    }
}
