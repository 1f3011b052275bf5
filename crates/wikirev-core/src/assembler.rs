//! Revision assembly and completeness verification.
//!
//! Each [`ArticleHistory`] is owned by exactly one pipeline; nothing here is
//! shared across threads.

use rustc_hash::FxHashSet;

use crate::decode::PageSummary;
use crate::error::{FetchError, VerificationFailure};
use crate::model::{ArticleTarget, CompletedHistory, RevisionRecord};

/// Accumulating state for one article
#[derive(Debug)]
pub struct ArticleHistory {
    target: ArticleTarget,
    title: Option<String>,
    page_id: Option<u64>,
    seen: FxHashSet<u64>,
    revisions: Vec<RevisionRecord>,
    duplicates: usize,
    expected_count: Option<u64>,
    missing: bool,
    invalid: bool,
}

impl ArticleHistory {
    pub fn new(target: ArticleTarget) -> Self {
        Self {
            target,
            title: None,
            page_id: None,
            seen: FxHashSet::default(),
            revisions: Vec::new(),
            duplicates: 0,
            expected_count: None,
            missing: false,
            invalid: false,
        }
    }

    pub fn target(&self) -> &ArticleTarget {
        &self.target
    }

    /// Canonical title once the API has reported one
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Add a record unless its id was already ingested.
    ///
    /// Returns `false` for a duplicate, which is dropped.
    pub fn ingest(&mut self, record: RevisionRecord) -> bool {
        if !self.seen.insert(record.revid) {
            self.duplicates += 1;
            return false;
        }
        self.revisions.push(record);
        true
    }

    /// Merge what the API said about the page itself
    pub fn note_page(&mut self, page: &PageSummary) {
        if self.title.is_none() {
            self.title.clone_from(&page.title);
        }
        if self.page_id.is_none() {
            self.page_id = page.page_id;
        }
        self.missing |= page.missing;
        self.invalid |= page.invalid;
    }

    pub fn set_expected_count(&mut self, count: u64) {
        self.expected_count = Some(count);
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn first_revid(&self) -> Option<u64> {
        self.revisions.iter().map(|r| r.revid).min()
    }

    pub fn last_revid(&self) -> Option<u64> {
        self.revisions.iter().map(|r| r.revid).max()
    }

    /// Sort by revision id and verify the sequence.
    ///
    /// Strictly increasing ids with no repeats are required; when a count
    /// hint was set the lengths must also agree.
    pub fn finalize(mut self) -> Result<CompletedHistory, FetchError> {
        if self.missing {
            return Err(FetchError::NotFound);
        }
        if self.invalid {
            return Err(FetchError::Rejected {
                code: "invalidtitle".to_string(),
                message: format!("{} is not a valid title", self.target),
            });
        }
        if self.revisions.is_empty() {
            return Err(FetchError::CompletenessVerification(
                VerificationFailure::NoRevisions,
            ));
        }

        self.revisions.sort_unstable_by_key(|r| r.revid);
        verify_sequence(&self.revisions).map_err(FetchError::CompletenessVerification)?;

        if let Some(expected) = self.expected_count {
            let assembled = self.revisions.len() as u64;
            if assembled != expected {
                return Err(FetchError::CompletenessVerification(
                    VerificationFailure::CountMismatch {
                        expected,
                        assembled,
                    },
                ));
            }
        }

        Ok(CompletedHistory {
            target: self.target,
            title: self.title,
            page_id: self.page_id,
            revisions: self.revisions,
            expected_count: self.expected_count,
            duplicates_dropped: self.duplicates,
        })
    }
}

/// Strictly increasing revision ids
pub fn verify_sequence(revisions: &[RevisionRecord]) -> Result<(), VerificationFailure> {
    for pair in revisions.windows(2) {
        let (previous, next) = (pair[0].revid, pair[1].revid);
        if next == previous {
            return Err(VerificationFailure::Duplicate(next));
        }
        if next < previous {
            return Err(VerificationFailure::OutOfOrder { previous, next });
        }
    }
    Ok(())
}
