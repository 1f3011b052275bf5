//! Data model shared by every stage of the fetch engine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::error::FetchError;

/// What to retrieve for each article
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Only the current revision of each article
    LatestRevision,
    /// Every revision, oldest first
    #[default]
    FullHistory,
}

impl Mode {
    /// Parse CLI/config string into enum
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "latest-revision" | "latest" => Some(Self::LatestRevision),
            "full-history" | "history" => Some(Self::FullHistory),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::LatestRevision => "latest-revision",
            Self::FullHistory => "full-history",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One article to fetch, addressed by title or by page id.
///
/// A single request never mixes the two forms (the API rejects `titles`
/// together with `pageids`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArticleTarget {
    Title(String),
    PageId(u64),
}

impl ArticleTarget {
    /// `pageid:123` selects a page id, anything else is a title
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix("pageid:").and_then(|id| id.trim().parse().ok()) {
            Some(id) => Self::PageId(id),
            None => Self::Title(s.trim().to_string()),
        }
    }

    pub fn is_title(&self) -> bool {
        matches!(self, Self::Title(_))
    }

    /// Name safe to use as a file stem
    pub fn file_stem(&self) -> String {
        match self {
            Self::Title(t) => t
                .chars()
                .map(|c| match c {
                    '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                    c if c.is_whitespace() => '_',
                    c => c,
                })
                .collect(),
            Self::PageId(id) => format!("pageid_{id}"),
        }
    }
}

impl fmt::Display for ArticleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Title(t) => f.write_str(t),
            Self::PageId(id) => write!(f, "pageid:{id}"),
        }
    }
}

/// One saved version of an article.
///
/// `user`, `user_id` and `content` are absent when the revision was
/// suppressed on the wiki; such revisions still count towards completeness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionRecord {
    pub revid: u64,
    pub parent_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub user: Option<String>,
    pub user_id: Option<u64>,
    pub content: Option<String>,
}

/// Opaque pagination cursor: the API's `continue` object, echoed verbatim.
///
/// Values are never inspected; the only operations are equality (stall
/// detection) and handing the pairs back as query parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContinuationToken(Vec<(String, String)>);

impl ContinuationToken {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ContinuationToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let pairs = map
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        Ok(Self(pairs))
    }
}

/// Which remote endpoint a request goes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Action API `api.php` query module
    Query,
    /// REST edit count between two revisions (exclusive of both)
    EditCount { title: String, from: u64, to: u64 },
}

/// One outbound API call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub endpoint: Endpoint,
    pub params: Vec<(&'static str, String)>,
    pub continuation: Option<ContinuationToken>,
}

impl FetchRequest {
    /// Fixed parameters followed by the continuation pairs
    pub fn query_pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        if let Some(token) = &self.continuation {
            pairs.extend(token.pairs().iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        pairs
    }
}

/// A verified, gap-checked, oldest-first history for one article
#[derive(Clone, Debug)]
pub struct CompletedHistory {
    pub target: ArticleTarget,
    /// Canonical title as reported by the API
    pub title: Option<String>,
    pub page_id: Option<u64>,
    pub revisions: Vec<RevisionRecord>,
    /// Total-count hint the sequence was checked against, if any
    pub expected_count: Option<u64>,
    /// Duplicate deliveries dropped during assembly
    pub duplicates_dropped: usize,
}

impl CompletedHistory {
    pub fn display_title(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| self.target.to_string())
    }

    pub fn latest(&self) -> Option<&RevisionRecord> {
        self.revisions.last()
    }
}

/// Terminal result per article
#[derive(Debug)]
pub enum FetchOutcome {
    Complete(CompletedHistory),
    Failed(FetchError),
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn history(&self) -> Option<&CompletedHistory> {
        match self {
            Self::Complete(h) => Some(h),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Self::Complete(_) => None,
            Self::Failed(e) => Some(e),
        }
    }
}

impl From<Result<CompletedHistory, FetchError>> for FetchOutcome {
    fn from(r: Result<CompletedHistory, FetchError>) -> Self {
        match r {
            Ok(h) => Self::Complete(h),
            Err(e) => Self::Failed(e),
        }
    }
}
