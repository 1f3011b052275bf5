//! One fetch pipeline: the continuation loop for a single article's history,
//! or for one batch of articles in latest-revision mode.
//!
//! Requests within a pipeline are strictly sequential; every request passes
//! through the shared rate limiter and is retried here, never in the
//! transport.

use std::sync::atomic::Ordering;

use indicatif::ProgressBar;
use rustc_hash::FxHashMap;

use crate::assembler::ArticleHistory;
use crate::cancel::CancelFlag;
use crate::config::FetchConfig;
use crate::continuation::{ContinuationManager, CursorState};
use crate::decode::{self, DecodeEvent, PageSummary};
use crate::error::{FetchError, IssueError};
use crate::limiter::{RateLimiter, Signal};
use crate::model::{
    ArticleTarget, ContinuationToken, Endpoint, FetchOutcome, FetchRequest, Mode, RevisionRecord,
};
use crate::retry::{RetryBudget, Verdict};
use crate::transport::Transport;

/// Everything a pipeline borrows from its orchestrator
pub struct PipelineContext<'a, T: ?Sized> {
    pub config: &'a FetchConfig,
    pub transport: &'a T,
    pub limiter: &'a RateLimiter,
    pub cancel: &'a CancelFlag,
}

/// Terminal outcome per target (same order as given) plus pages fetched
pub struct PipelineResult {
    pub outcomes: Vec<FetchOutcome>,
    pub pages: usize,
}

impl<T: Transport + ?Sized> PipelineContext<'_, T> {
    /// Fetch every page for `targets`, then verify and finalize each article.
    ///
    /// `targets` must be non-empty and all titles or all page ids.
    pub fn run(&self, mode: Mode, targets: &[ArticleTarget], pb: &ProgressBar) -> PipelineResult {
        let label = job_label(targets);
        let refs: Vec<&ArticleTarget> = targets.iter().collect();
        let mut manager = ContinuationManager::for_targets(self.config, mode, &refs);
        let mut router = Router::new(targets);

        while let Some(request) = manager.next_request() {
            let token = match self.fetch_page(&label, &request, &mut router, pb) {
                Ok(token) => token,
                Err(e) => {
                    manager.fail();
                    return PipelineResult {
                        outcomes: router.fail_all(&e),
                        pages: manager.pages(),
                    };
                }
            };
            if manager.advance(token) == CursorState::Failed {
                let e = FetchError::ContinuationStalled {
                    page: manager.pages(),
                };
                log::error!("{label}: {e}");
                return PipelineResult {
                    outcomes: router.fail_all(&e),
                    pages: manager.pages(),
                };
            }
            pb.set_message(format!(
                "page {}, {} revisions",
                manager.pages(),
                router.revisions()
            ));
            log::debug!(
                "{label}: page {} done, {} revisions so far",
                manager.pages(),
                router.revisions()
            );
        }

        let outcomes = router
            .histories
            .into_iter()
            .map(|mut history| {
                if mode == Mode::FullHistory && self.config.verify_count && history.len() >= 2 {
                    match self.count_hint(&history, pb) {
                        Ok(Some(hint)) => history.set_expected_count(hint),
                        Ok(None) => {}
                        Err(e) => return FetchOutcome::Failed(e),
                    }
                }
                history.finalize().into()
            })
            .collect();

        PipelineResult {
            outcomes,
            pages: manager.pages(),
        }
    }

    /// Issue one request until it succeeds or the retry budget runs out.
    ///
    /// Cancellation is checked before every attempt.
    fn with_retries<R>(
        &self,
        label: &str,
        pb: &ProgressBar,
        mut attempt_fn: impl FnMut() -> Result<R, IssueError>,
    ) -> Result<R, FetchError> {
        let mut budget = RetryBudget::new(self.config);
        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let Some(permit) = self.limiter.acquire(self.cancel) else {
                return Err(FetchError::Cancelled);
            };
            let err = match attempt_fn() {
                Ok(v) => {
                    permit.report(Signal::Success);
                    return Ok(v);
                }
                Err(e) => e,
            };
            permit.report(match &err {
                IssueError::Throttled { retry_after, .. } => Signal::Throttled(*retry_after),
                _ => Signal::Failure,
            });

            match budget.record(&err) {
                Verdict::Retry(delay) => {
                    if matches!(err, IssueError::Throttled { .. }) {
                        log::warn!("{label}: {err}, backing off");
                    } else {
                        pb.set_message(format!(
                            "retry {}/{}...",
                            budget.failures(),
                            budget.max_retries()
                        ));
                        log::debug!(
                            "{label}: attempt {} failed: {err}, retrying in {}ms",
                            budget.attempts(),
                            delay.as_millis()
                        );
                    }
                    if !delay.is_zero() && !self.cancel.sleep(delay) {
                        return Err(FetchError::Cancelled);
                    }
                }
                Verdict::GiveUp => {
                    let e = err.into_fetch_error(budget.attempts());
                    log::error!("{label}: failed permanently: {e}");
                    return Err(e);
                }
            }
        }
    }

    fn fetch_page(
        &self,
        label: &str,
        request: &FetchRequest,
        router: &mut Router,
        pb: &ProgressBar,
    ) -> Result<Option<ContinuationToken>, FetchError> {
        self.with_retries(label, pb, || {
            let body = self.transport.execute(request)?;
            let retry_after = body.retry_after();
            let bytes = body.bytes();
            let response = decode::decode_query(body.into_reader(), |event| router.accept(event))
                .map_err(|e| IssueError::from_decode(&e))?;
            router.settle();
            log::debug!(
                "{label}: {} revisions from {} pages ({} bytes)",
                response.revisions,
                response.pages,
                bytes.load(Ordering::Relaxed)
            );
            if let Some(err) = response.api_error {
                return Err(IssueError::from_api(&err.code, &err.info, retry_after));
            }
            Ok(response.continuation)
        })
    }

    /// Total-count hint from the REST edit counter, bounded by the fetched
    /// revision range so concurrent edits cannot skew it.
    ///
    /// The endpoint excludes both bounding revisions. A capped or failed
    /// count request yields no hint; only cancellation is an error.
    fn count_hint(
        &self,
        history: &ArticleHistory,
        pb: &ProgressBar,
    ) -> Result<Option<u64>, FetchError> {
        let title = match (history.title(), history.target()) {
            (Some(t), _) => t.to_string(),
            (None, ArticleTarget::Title(t)) => t.clone(),
            (None, ArticleTarget::PageId(_)) => return Ok(None),
        };
        let (Some(from), Some(to)) = (history.first_revid(), history.last_revid()) else {
            return Ok(None);
        };
        let request = FetchRequest {
            endpoint: Endpoint::EditCount {
                title: title.clone(),
                from,
                to,
            },
            params: vec![("from", from.to_string()), ("to", to.to_string())],
            continuation: None,
        };
        pb.set_message("verifying count...");

        let label = format!("{title} (count)");
        let result = self.with_retries(&label, pb, || {
            let body = self.transport.execute(&request)?;
            decode::decode_edit_count(body.into_reader()).map_err(|e| IssueError::from_decode(&e))
        });
        match result {
            Ok(count) if count.limit => {
                log::debug!("{title}: edit count capped at {}, skipping count check", count.count);
                Ok(None)
            }
            Ok(count) => Ok(Some(count.count + 2)),
            Err(FetchError::Cancelled) => Err(FetchError::Cancelled),
            Err(e) => {
                log::warn!("{title}: edit count unavailable ({e}), checking order only");
                Ok(None)
            }
        }
    }
}

fn job_label(targets: &[ArticleTarget]) -> String {
    match targets {
        [one] => one.to_string(),
        [first, rest @ ..] => format!("{first} (+{})", rest.len()),
        [] => "empty".to_string(),
    }
}

/// Maps pages in a response back to the caller's targets.
///
/// The API answers with canonical titles; a requested title is matched
/// either directly, through a `normalized` entry, or by page id. Several
/// targets may resolve to one page (aliases, repeated titles); each of them
/// receives the page.
struct Router {
    histories: Vec<ArticleHistory>,
    by_title: FxHashMap<String, Vec<usize>>,
    by_page_id: FxHashMap<u64, Vec<usize>>,
    /// Items that arrived before the mapping that resolves them
    pending_revisions: Vec<(Option<u64>, Option<String>, RevisionRecord)>,
    pending_pages: Vec<PageSummary>,
    revisions: usize,
}

impl Router {
    fn new(targets: &[ArticleTarget]) -> Self {
        let mut by_title = FxHashMap::default();
        let mut by_page_id = FxHashMap::default();
        for (i, t) in targets.iter().enumerate() {
            match t {
                ArticleTarget::Title(s) => {
                    by_title.entry(s.clone()).or_insert_with(Vec::new).push(i);
                }
                ArticleTarget::PageId(id) => {
                    by_page_id.entry(*id).or_insert_with(Vec::new).push(i);
                }
            }
        }
        Self {
            histories: targets.iter().cloned().map(ArticleHistory::new).collect(),
            by_title,
            by_page_id,
            pending_revisions: Vec::new(),
            pending_pages: Vec::new(),
            revisions: 0,
        }
    }

    fn revisions(&self) -> usize {
        self.revisions
    }

    /// Every target the page answers; empty while unresolved
    fn resolve(&self, page_id: Option<u64>, title: Option<&str>) -> Vec<usize> {
        if self.histories.len() == 1 {
            return vec![0];
        }
        if let Some(ix) = page_id.and_then(|id| self.by_page_id.get(&id)) {
            return ix.clone();
        }
        title
            .and_then(|t| self.by_title.get(t))
            .cloned()
            .unwrap_or_default()
    }

    fn accept(&mut self, event: DecodeEvent<'_>) {
        match event {
            DecodeEvent::Normalized { from, to } => {
                if let Some(ix) = self.by_title.get(from).cloned() {
                    let aliases = self.by_title.entry(to.to_string()).or_default();
                    for i in ix {
                        if !aliases.contains(&i) {
                            aliases.push(i);
                        }
                    }
                }
            }
            DecodeEvent::Revision {
                page_id,
                title,
                record,
            } => {
                let ix = self.resolve(page_id, title);
                if ix.is_empty() {
                    self.pending_revisions
                        .push((page_id, title.map(str::to_string), record));
                } else {
                    self.deliver(&ix, record);
                }
            }
            DecodeEvent::Page(page) => {
                let ix = self.resolve(page.page_id, page.title.as_deref());
                if ix.is_empty() {
                    self.pending_pages.push(page.clone());
                }
                for i in ix {
                    self.histories[i].note_page(page);
                }
            }
        }
    }

    fn deliver(&mut self, ix: &[usize], record: RevisionRecord) {
        if let Some((&last, rest)) = ix.split_last() {
            for &i in rest {
                self.ingest(i, record.clone());
            }
            self.ingest(last, record);
        }
    }

    fn ingest(&mut self, i: usize, record: RevisionRecord) {
        let revid = record.revid;
        if self.histories[i].ingest(record) {
            self.revisions += 1;
        } else {
            log::debug!("{}: dropped duplicate revision {revid}", self.histories[i].target());
        }
    }

    /// Resolve held items once the whole response is in; drop strays
    fn settle(&mut self) {
        for (page_id, title, record) in std::mem::take(&mut self.pending_revisions) {
            let ix = self.resolve(page_id, title.as_deref());
            if ix.is_empty() {
                log::warn!(
                    "revision {} for unrequested page {:?} dropped",
                    record.revid,
                    title.as_deref().unwrap_or("?")
                );
            } else {
                self.deliver(&ix, record);
            }
        }
        for page in std::mem::take(&mut self.pending_pages) {
            let ix = self.resolve(page.page_id, page.title.as_deref());
            if ix.is_empty() {
                log::warn!(
                    "unrequested page {:?} in response ignored",
                    page.title.as_deref().unwrap_or("?")
                );
            }
            for i in ix {
                self.histories[i].note_page(&page);
            }
        }
    }

    fn fail_all(&self, e: &FetchError) -> Vec<FetchOutcome> {
        self.histories
            .iter()
            .map(|_| FetchOutcome::Failed(e.clone()))
            .collect()
    }
}
