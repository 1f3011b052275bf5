//! HTTP request issuer with streaming body, gzip decompression and read timeout.
//!
//! Uses async reqwest internally with tokio::time::timeout for stall detection,
//! but presents a sync interface for the worker threads. One call performs one
//! network round trip and classifies the result; it never retries.

use std::io::{self, BufRead, BufReader, Read};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::task::Context;
use std::time::Duration;

use flate2::read::GzDecoder;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT_ENCODING, CONTENT_ENCODING, RETRY_AFTER};
use reqwest::Url;
use tokio::io::{AsyncRead, ReadBuf};

use crate::config::FetchConfig;
use crate::error::IssueError;
use crate::model::{Endpoint, FetchRequest};

/// Buffer size for the body reader (256KB; history pages run to megabytes)
const BODY_BUF_SIZE: usize = 256 * 1024;

/// Shared byte counter for progress tracking
pub type ByteCounter = Arc<AtomicU64>;

/// A successful response whose body has not been read yet
pub struct ResponseBody {
    reader: Box<dyn BufRead + Send>,
    retry_after: Option<Duration>,
    bytes: ByteCounter,
}

impl ResponseBody {
    pub fn new(reader: Box<dyn BufRead + Send>, retry_after: Option<Duration>) -> Self {
        Self {
            reader,
            retry_after,
            bytes: ByteCounter::default(),
        }
    }

    /// Wrap an in-memory body (scripted transports, benchmarks)
    pub fn from_bytes(body: impl Into<Vec<u8>>) -> Self {
        Self::new(Box::new(io::Cursor::new(body.into())), None)
    }

    /// `Retry-After` sent alongside the body (MediaWiki sets it on maxlag)
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Compressed bytes received so far
    pub fn bytes(&self) -> ByteCounter {
        self.bytes.clone()
    }

    pub fn into_reader(self) -> Box<dyn BufRead + Send> {
        self.reader
    }
}

/// Executes one [`FetchRequest`]; owned by the orchestrator and shared by
/// every pipeline.
pub trait Transport: Send + Sync {
    fn execute(&self, request: &FetchRequest) -> Result<ResponseBody, IssueError>;
}

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// reqwest-backed transport for the MediaWiki Action and REST APIs
pub struct HttpTransport {
    client: reqwest::Client,
    api_url: Url,
    rest_url: Url,
    read_timeout: Duration,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("api_url", &self.api_url.as_str())
            .field("rest_url", &self.rest_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build a client carrying the configured `User-Agent`
    pub fn new(config: &FetchConfig) -> Result<Self, IssueError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.concurrency)
            .build()
            .map_err(|e| IssueError::from_reqwest(&e))?;
        let parse = |s: String| {
            Url::parse(&s).map_err(|e| IssueError::Rejected {
                code: "config".to_string(),
                message: format!("invalid endpoint {s}: {e}"),
            })
        };
        Ok(Self {
            client,
            api_url: parse(config.api_url())?,
            rest_url: parse(config.rest_url())?,
            read_timeout: config.read_timeout(),
        })
    }

    fn url_for(&self, endpoint: &Endpoint) -> Result<Url, IssueError> {
        match endpoint {
            Endpoint::Query => Ok(self.api_url.clone()),
            Endpoint::EditCount { title, .. } => {
                let mut url = self.rest_url.clone();
                url.path_segments_mut()
                    .map_err(|()| IssueError::Rejected {
                        code: "config".to_string(),
                        message: format!("REST endpoint cannot take a path: {}", self.rest_url),
                    })?
                    .pop_if_empty()
                    .extend(["page", title.as_str(), "history", "counts", "edits"]);
                Ok(url)
            }
        }
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: &FetchRequest) -> Result<ResponseBody, IssueError> {
        let url = self.url_for(&request.endpoint)?;
        let pairs = request.query_pairs();

        let (reader, retry_after, gzip) = SHARED_RUNTIME.handle().block_on(async {
            let response = self
                .client
                .get(url)
                .query(&pairs)
                .header(ACCEPT_ENCODING, "gzip")
                .send()
                .await
                .map_err(|e| IssueError::from_reqwest(&e))?;

            let status = response.status();
            let retry_after = parse_retry_after(response.headers());
            if !status.is_success() {
                return Err(IssueError::from_status(
                    status.as_u16(),
                    retry_after,
                    status.canonical_reason().unwrap_or("unexpected status"),
                ));
            }

            let gzip = response
                .headers()
                .get(CONTENT_ENCODING)
                .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"));

            // Convert response body stream to AsyncRead
            let stream = response.bytes_stream();
            let async_reader = tokio_util::io::StreamReader::new(
                stream.map(|result| result.map_err(io::Error::other)),
            );

            Ok::<_, IssueError>((
                TimeoutReader::new(Box::pin(async_reader), self.read_timeout),
                retry_after,
                gzip,
            ))
        })?;

        let counter = ByteCounter::default();
        let counting = CountingReader {
            inner: reader,
            count: counter.clone(),
        };
        let reader: Box<dyn BufRead + Send> = if gzip {
            Box::new(BufReader::with_capacity(
                BODY_BUF_SIZE,
                GzDecoder::new(counting),
            ))
        } else {
            Box::new(BufReader::with_capacity(BODY_BUF_SIZE, counting))
        };

        Ok(ResponseBody {
            reader,
            retry_after,
            bytes: counter,
        })
    }
}

/// `Retry-After` in delta-seconds form (the form MediaWiki sends)
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Reader wrapper that tracks bytes read
pub struct CountingReader<R> {
    inner: R,
    count: ByteCounter,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Async-to-sync bridge with read timeout.
///
/// Each read operation has a timeout - if no data arrives within the
/// configured window, returns TimedOut (classified as transient).
pub struct TimeoutReader {
    inner: Pin<Box<dyn AsyncRead + Send>>,
    timeout: Duration,
}

impl TimeoutReader {
    fn new(inner: Pin<Box<dyn AsyncRead + Send>>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.timeout;
        SHARED_RUNTIME.handle().block_on(async {
            let read_future = async {
                let mut read_buf = ReadBuf::new(buf);
                std::future::poll_fn(|cx: &mut Context<'_>| {
                    Pin::as_mut(&mut self.inner).poll_read(cx, &mut read_buf)
                })
                .await?;
                Ok::<_, io::Error>(read_buf.filled().len())
            };

            match tokio::time::timeout(timeout, read_future).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("read timeout ({}s with no data)", timeout.as_secs()),
                )),
            }
        })
    }
}
