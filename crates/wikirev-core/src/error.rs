//! Error taxonomy: per-request classification and per-article terminal failures

use std::fmt;
use std::time::Duration;

/// Outcome classification for one request (HTTP call + body decode).
///
/// Produced by the transport and the decoder, resolved by the page retry
/// loop; never surfaces to callers directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueError {
    /// Timeout, connection reset, 5xx, stalled body stream
    Transient {
        status: Option<u16>,
        message: String,
    },
    /// Explicit remote rate-limit or load signal
    Throttled {
        retry_after: Option<Duration>,
        message: String,
    },
    /// Article (or endpoint resource) does not exist
    NotFound { message: String },
    /// Permanent refusal: bad parameters, 4xx, unknown API error code
    Rejected { code: String, message: String },
    /// Body could not be decoded (truncated, invalid JSON, schema mismatch)
    Decode(String),
}

impl fmt::Display for IssueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Transient {
                status: None,
                message,
            } => write!(f, "network error: {message}"),
            Self::Throttled {
                retry_after: Some(d),
                message,
            } => write!(f, "throttled (retry after {}s): {message}", d.as_secs()),
            Self::Throttled {
                retry_after: None,
                message,
            } => write!(f, "throttled: {message}"),
            Self::NotFound { message } => write!(f, "not found: {message}"),
            Self::Rejected { code, message } => write!(f, "rejected [{code}]: {message}"),
            Self::Decode(message) => write!(f, "malformed response: {message}"),
        }
    }
}

impl std::error::Error for IssueError {}

impl IssueError {
    /// Classify an HTTP status that is not a success
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: &str) -> Self {
        let message = message.to_string();
        match status {
            429 | 503 => Self::Throttled {
                retry_after,
                message,
            },
            404 | 410 => Self::NotFound { message },
            408 | 500..=599 => Self::Transient {
                status: Some(status),
                message,
            },
            _ => Self::Rejected {
                code: format!("http-{status}"),
                message,
            },
        }
    }

    /// Classify a reqwest error (connect, timeout, status, builder)
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        let message = e.to_string();
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), None, &message);
        }
        if e.is_builder() {
            return Self::Rejected {
                code: "request".to_string(),
                message,
            };
        }
        Self::Transient {
            status: None,
            message,
        }
    }

    /// Classify a decode failure: I/O while streaming is a network problem,
    /// anything else (EOF, syntax, schema) is a malformed body.
    pub fn from_decode(e: &serde_json::Error) -> Self {
        if e.is_io() {
            Self::Transient {
                status: None,
                message: e.to_string(),
            }
        } else {
            Self::Decode(e.to_string())
        }
    }

    /// Classify an `{"error": {...}}` payload delivered with HTTP 200
    pub fn from_api(code: &str, info: &str, retry_after: Option<Duration>) -> Self {
        let message = format!("{code}: {info}");
        match code {
            "maxlag" | "ratelimited" | "readonly" => Self::Throttled {
                retry_after,
                message,
            },
            "missingtitle" | "nosuchpageid" | "nosuchrevid" => Self::NotFound { message },
            "internal_api_error_DBQueryError" | "internal_api_error_DBQueryTimeoutError" => {
                Self::Transient {
                    status: None,
                    message,
                }
            }
            _ => Self::Rejected {
                code: code.to_string(),
                message: info.to_string(),
            },
        }
    }

    /// Re-issuing the same request may succeed (throttles included)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Throttled { .. } | Self::Decode(_)
        )
    }

    /// Throttles are cooperative and do not consume the retry budget
    pub fn counts_against_retries(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Decode(_))
    }

    /// Convert into the article-level failure after `attempts` tries
    pub fn into_fetch_error(self, attempts: u32) -> FetchError {
        match self {
            Self::Transient { .. } => FetchError::TransientNetwork {
                attempts,
                last: self.to_string(),
            },
            Self::Throttled { .. } => FetchError::Throttled { attempts },
            Self::NotFound { .. } => FetchError::NotFound,
            Self::Rejected { code, message } => FetchError::Rejected { code, message },
            Self::Decode(last) => FetchError::MalformedResponse { attempts, last },
        }
    }
}

/// Why an assembled sequence was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationFailure {
    OutOfOrder { previous: u64, next: u64 },
    Duplicate(u64),
    CountMismatch { expected: u64, assembled: u64 },
    NoRevisions,
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrder { previous, next } => {
                write!(f, "revision {next} follows {previous}")
            }
            Self::Duplicate(id) => write!(f, "revision {id} appears twice"),
            Self::CountMismatch {
                expected,
                assembled,
            } => write!(
                f,
                "API reports {expected} revisions, assembled {assembled}"
            ),
            Self::NoRevisions => f.write_str("no revisions delivered"),
        }
    }
}

/// Terminal per-article failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    TransientNetwork { attempts: u32, last: String },
    Throttled { attempts: u32 },
    MalformedResponse { attempts: u32, last: String },
    NotFound,
    Rejected { code: String, message: String },
    /// The API returned the continuation token it was just given
    ContinuationStalled { page: usize },
    CompletenessVerification(VerificationFailure),
    Cancelled,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientNetwork { attempts, last } => {
                write!(f, "network failure after {attempts} attempts: {last}")
            }
            Self::Throttled { attempts } => {
                write!(f, "still throttled after {attempts} attempts")
            }
            Self::MalformedResponse { attempts, last } => {
                write!(f, "malformed response after {attempts} attempts: {last}")
            }
            Self::NotFound => f.write_str("article does not exist"),
            Self::Rejected { code, message } => write!(f, "request rejected [{code}]: {message}"),
            Self::ContinuationStalled { page } => {
                write!(f, "continuation did not advance after page {page}")
            }
            Self::CompletenessVerification(v) => write!(f, "completeness check failed: {v}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    /// Short label for summary tables
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientNetwork { .. } => "network",
            Self::Throttled { .. } => "throttled",
            Self::MalformedResponse { .. } => "malformed",
            Self::NotFound => "not-found",
            Self::Rejected { .. } => "rejected",
            Self::ContinuationStalled { .. } => "stalled",
            Self::CompletenessVerification(_) => "incomplete",
            Self::Cancelled => "cancelled",
        }
    }
}
