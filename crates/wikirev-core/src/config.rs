//! Fetch engine configuration

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::model::Mode;

/// Upper bound on `rvlimit` when revision content is requested
pub const MAX_CONTENT_PAGE_SIZE: u32 = 50;

/// Upper bound on titles per request for non-bot clients
pub const MAX_TITLES_PER_REQUEST: usize = 50;

/// `exlimit` ceiling of the TextExtracts API
pub const MAX_EXTRACTS_PER_REQUEST: usize = 20;

pub const DEFAULT_USER_AGENT: &str = concat!(
    "wikirev/",
    env!("CARGO_PKG_VERSION"),
    " (set fetch.user_agent to include your contact details)"
);

/// Throttle backoff parameters for the shared rate limiter
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Lowest inter-request spacing (raised to 1/requests_per_second if larger)
    pub floor_ms: u64,
    /// Highest spacing a throttle storm can widen to
    pub ceiling_ms: u64,
    /// Factor applied on each throttle signal, divided out on decay
    pub multiplier: f64,
    /// Consecutive successes before spacing decays one step
    pub decay_after: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor_ms: 100,
            ceiling_ms: 60_000,
            multiplier: 2.0,
            decay_after: 10,
        }
    }
}

/// What latest-revision mode returns as each revision's text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatestContent {
    /// Raw wikitext of the revision
    #[default]
    Wikitext,
    /// Plain text from the TextExtracts API, markup already stripped
    Extract,
}

impl LatestContent {
    pub fn name(self) -> &'static str {
        match self {
            Self::Wikitext => "wikitext",
            Self::Extract => "extract",
        }
    }
}

/// Runtime configuration for a batch fetch
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Wiki language code, used to derive the endpoints
    pub lang: String,
    /// Override for the Action API endpoint
    pub api_url: Option<String>,
    /// Override for the REST API base (`.../w/rest.php/v1`)
    pub rest_url: Option<String>,
    pub user_agent: String,
    pub mode: Mode,
    /// Maximum simultaneous in-flight requests, across the whole batch
    pub concurrency: usize,
    pub requests_per_second: f64,
    /// Revisions per full-history request
    pub page_size: u32,
    /// Articles per latest-revision request
    pub latest_batch_size: usize,
    /// Latest-revision text: wikitext or a plain-text extract
    pub latest_content: LatestContent,
    /// Extracts stop at the first section heading
    pub intro_only: bool,
    /// Retries for transient and malformed responses, per page
    pub max_retries: u32,
    /// Throttle signals tolerated per page before giving up
    pub max_throttle_retries: u32,
    /// Base delay for transient-failure retries (doubles each attempt)
    pub retry_base_ms: u64,
    pub backoff: BackoffConfig,
    /// `maxlag` courtesy parameter in seconds
    pub maxlag: Option<u32>,
    /// Check assembled histories against the REST edit count
    pub verify_count: bool,
    pub connect_timeout_secs: u64,
    /// Stall detection: seconds with no body bytes
    pub read_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            lang: "en".to_string(),
            api_url: None,
            rest_url: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            mode: Mode::FullHistory,
            concurrency: 4,
            requests_per_second: 10.0,
            page_size: MAX_CONTENT_PAGE_SIZE,
            latest_batch_size: 20,
            latest_content: LatestContent::Wikitext,
            intro_only: false,
            max_retries: 3,
            max_throttle_retries: 20,
            retry_base_ms: 1_000,
            backoff: BackoffConfig::default(),
            maxlag: Some(5),
            verify_count: true,
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
        }
    }
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid fetch config: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl FetchConfig {
    pub fn api_url(&self) -> String {
        self.api_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.wikipedia.org/w/api.php", self.lang))
    }

    pub fn rest_url(&self) -> String {
        self.rest_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.wikipedia.org/w/rest.php/v1", self.lang))
    }

    /// Effective spacing floor: the larger of the backoff floor and 1/rps
    pub fn min_spacing(&self) -> Duration {
        let floor = Duration::from_millis(self.backoff.floor_ms);
        // Zero or vanishing rates saturate instead of panicking
        let rps = Duration::try_from_secs_f64(1.0 / self.requests_per_second)
            .unwrap_or(Duration::MAX);
        floor.max(rps)
    }

    /// Articles per latest-revision request after the extract limits.
    ///
    /// TextExtracts returns one full-text extract per request and up to
    /// [`MAX_EXTRACTS_PER_REQUEST`] intros.
    pub fn latest_batch(&self) -> usize {
        match self.latest_content {
            LatestContent::Wikitext => self.latest_batch_size,
            LatestContent::Extract if self.intro_only => {
                self.latest_batch_size.min(MAX_EXTRACTS_PER_REQUEST)
            }
            LatestContent::Extract => 1,
        }
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff.ceiling_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| -> Result<(), ConfigError> { Err(ConfigError(msg)) };
        if self.lang.is_empty() && (self.api_url.is_none() || self.rest_url.is_none()) {
            return fail("lang is empty and no endpoint overrides are set".into());
        }
        if self.user_agent.trim().is_empty() {
            return fail("user_agent must not be empty".into());
        }
        if self.concurrency == 0 {
            return fail("concurrency must be at least 1".into());
        }
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return fail(format!(
                "requests_per_second must be positive, got {}",
                self.requests_per_second
            ));
        }
        if self.page_size == 0 || self.page_size > MAX_CONTENT_PAGE_SIZE {
            return fail(format!(
                "page_size must be within 1..={MAX_CONTENT_PAGE_SIZE}, got {}",
                self.page_size
            ));
        }
        if self.latest_batch_size == 0 || self.latest_batch_size > MAX_TITLES_PER_REQUEST {
            return fail(format!(
                "latest_batch_size must be within 1..={MAX_TITLES_PER_REQUEST}, got {}",
                self.latest_batch_size
            ));
        }
        if !(self.backoff.multiplier.is_finite() && self.backoff.multiplier > 1.0) {
            return fail(format!(
                "backoff.multiplier must be greater than 1, got {}",
                self.backoff.multiplier
            ));
        }
        if self.backoff.floor_ms > self.backoff.ceiling_ms {
            return fail(format!(
                "backoff.floor_ms ({}) exceeds backoff.ceiling_ms ({})",
                self.backoff.floor_ms, self.backoff.ceiling_ms
            ));
        }
        if self.min_spacing() > self.backoff_ceiling() {
            return fail("1/requests_per_second exceeds backoff.ceiling_ms".into());
        }
        if self.backoff.decay_after == 0 {
            return fail("backoff.decay_after must be at least 1".into());
        }
        Ok(())
    }
}
