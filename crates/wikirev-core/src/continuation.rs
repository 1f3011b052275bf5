//! Per-article pagination state machine.
//!
//! Request parameters are fixed at construction; the only thing that changes
//! between pages is the continuation token, which is echoed back exactly as
//! the API sent it.

use crate::config::{FetchConfig, LatestContent};
use crate::model::{ArticleTarget, ContinuationToken, Endpoint, FetchRequest, Mode};

/// Cursor position within one article's (or one batch's) pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// No request issued yet
    Start,
    /// A request is out; it may be re-issued unchanged after a retryable failure
    AwaitingResponse,
    /// Last response carried a token; the next request resumes from it
    HasMore,
    /// Last response had no token
    Exhausted,
    Failed,
}

impl CursorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exhausted | Self::Failed)
    }
}

#[derive(Debug)]
pub struct ContinuationManager {
    params: Vec<(&'static str, String)>,
    token: Option<ContinuationToken>,
    state: CursorState,
    pages: usize,
}

impl ContinuationManager {
    pub fn new(params: Vec<(&'static str, String)>) -> Self {
        Self {
            params,
            token: None,
            state: CursorState::Start,
            pages: 0,
        }
    }

    /// Manager for `targets`, which must all be titles or all page ids
    pub fn for_targets(config: &FetchConfig, mode: Mode, targets: &[&ArticleTarget]) -> Self {
        Self::new(base_params(config, mode, targets))
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Completed pages (responses accepted via [`advance`](Self::advance))
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn token(&self) -> Option<&ContinuationToken> {
        self.token.as_ref()
    }

    /// Request for the current cursor position.
    ///
    /// Calling again before [`advance`](Self::advance) yields the same
    /// request, which is how a failed page is retried. `None` once terminal.
    pub fn next_request(&mut self) -> Option<FetchRequest> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = CursorState::AwaitingResponse;
        Some(FetchRequest {
            endpoint: Endpoint::Query,
            params: self.params.clone(),
            continuation: self.token.clone(),
        })
    }

    /// Accept a decoded response's continuation token.
    ///
    /// A token identical to the one just sent would repeat the same page
    /// forever, so it moves the cursor to `Failed`.
    pub fn advance(&mut self, next: Option<ContinuationToken>) -> CursorState {
        debug_assert_eq!(self.state, CursorState::AwaitingResponse);
        self.pages += 1;
        self.state = match next {
            None => CursorState::Exhausted,
            Some(t) if self.token.as_ref() == Some(&t) => CursorState::Failed,
            Some(t) => {
                self.token = Some(t);
                CursorState::HasMore
            }
        };
        self.state
    }

    /// Retries exhausted or fatal error
    pub fn fail(&mut self) {
        self.state = CursorState::Failed;
    }
}

/// Fixed query parameters for one pipeline
pub fn base_params(
    config: &FetchConfig,
    mode: Mode,
    targets: &[&ArticleTarget],
) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("action", "query".to_string()),
        ("format", "json".to_string()),
        ("formatversion", "2".to_string()),
    ];
    let extracts = mode == Mode::LatestRevision && config.latest_content == LatestContent::Extract;
    if extracts {
        // Revision metadata without text; the page-level extract supplies it
        params.push(("prop", "revisions|extracts".to_string()));
        params.push(("rvprop", "ids|timestamp|user|userid".to_string()));
        params.push(("explaintext", "1".to_string()));
        params.push(("exlimit", config.latest_batch().to_string()));
        if config.intro_only {
            params.push(("exintro", "1".to_string()));
        }
    } else {
        params.push(("prop", "revisions".to_string()));
        params.push(("rvprop", "ids|timestamp|user|userid|content".to_string()));
        params.push(("rvslots", "main".to_string()));
    }
    if let Some(lag) = config.maxlag {
        params.push(("maxlag", lag.to_string()));
    }

    let mut titles = Vec::new();
    let mut ids = Vec::new();
    for t in targets {
        match t {
            ArticleTarget::Title(s) => titles.push(s.as_str()),
            ArticleTarget::PageId(id) => ids.push(id.to_string()),
        }
    }
    debug_assert!(titles.is_empty() || ids.is_empty());
    if !titles.is_empty() {
        params.push(("titles", titles.join("|")));
    } else {
        params.push(("pageids", ids.join("|")));
    }

    if mode == Mode::FullHistory {
        params.push(("rvlimit", config.page_size.to_string()));
        params.push(("rvdir", "newer".to_string()));
    }
    params
}
