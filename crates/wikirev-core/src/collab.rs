//! Interfaces to the collaborators downstream of a verified history:
//! text cleaning and persistence.

use std::fmt;
use std::io;

use rayon::prelude::*;

use crate::model::CompletedHistory;

/// Cleaning failed for one revision's text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanError(pub String);

impl fmt::Display for CleanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "text cleaning failed: {}", self.0)
    }
}

impl std::error::Error for CleanError {}

/// Turns raw wikitext into cleaned text
pub trait TextCleaner: Sync {
    fn clean(&self, raw: &str) -> Result<String, CleanError>;
}

/// Counts from one [`clean_history`] pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanStats {
    pub cleaned: usize,
    pub failed: usize,
    /// Revisions without text (suppressed on the wiki)
    pub skipped: usize,
}

/// Replace each revision's content with its cleaned form, in parallel.
///
/// A failure leaves that revision without content and is only logged: the
/// revision itself stays, so the verified sequence is unchanged.
pub fn clean_history<C: TextCleaner + ?Sized>(
    history: &mut CompletedHistory,
    cleaner: &C,
) -> CleanStats {
    let title = history.display_title();
    history
        .revisions
        .par_iter_mut()
        .map(|rev| {
            let Some(raw) = rev.content.as_deref() else {
                return CleanStats {
                    skipped: 1,
                    ..Default::default()
                };
            };
            match cleaner.clean(raw) {
                Ok(text) => {
                    rev.content = Some(text);
                    CleanStats {
                        cleaned: 1,
                        ..Default::default()
                    }
                }
                Err(e) => {
                    log::warn!("{title}: revision {}: {e}", rev.revid);
                    rev.content = None;
                    CleanStats {
                        failed: 1,
                        ..Default::default()
                    }
                }
            }
        })
        .reduce(CleanStats::default, |a, b| CleanStats {
            cleaned: a.cleaned + b.cleaned,
            failed: a.failed + b.failed,
            skipped: a.skipped + b.skipped,
        })
}

/// Persists completed histories; called once per finished article, possibly
/// from several worker threads at once.
pub trait OutcomeSink: Sync {
    fn write(&self, history: &CompletedHistory) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArticleTarget, RevisionRecord};
    use chrono::{TimeZone, Utc};

    struct Upper;

    impl TextCleaner for Upper {
        fn clean(&self, raw: &str) -> Result<String, CleanError> {
            if raw.contains("{{broken") {
                return Err(CleanError("unbalanced template".to_string()));
            }
            Ok(raw.to_uppercase())
        }
    }

    fn history(texts: &[Option<&str>]) -> CompletedHistory {
        CompletedHistory {
            target: ArticleTarget::Title("Knower".to_string()),
            title: None,
            page_id: None,
            revisions: texts
                .iter()
                .enumerate()
                .map(|(i, t)| RevisionRecord {
                    revid: i as u64 + 1,
                    parent_id: None,
                    timestamp: Utc.timestamp_opt(1_500_000_000, 0).unwrap(),
                    user: None,
                    user_id: None,
                    content: t.map(str::to_string),
                })
                .collect(),
            expected_count: None,
            duplicates_dropped: 0,
        }
    }

    #[test]
    fn cleans_every_revision() {
        let mut h = history(&[Some("a"), Some("b")]);
        let stats = clean_history(&mut h, &Upper);
        assert_eq!(stats.cleaned, 2);
        assert_eq!(h.revisions[1].content.as_deref(), Some("B"));
    }

    #[test]
    fn failure_keeps_revision() {
        let mut h = history(&[Some("ok"), Some("{{broken"), None]);
        let stats = clean_history(&mut h, &Upper);
        assert_eq!(
            stats,
            CleanStats {
                cleaned: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert_eq!(h.revisions.len(), 3);
        assert!(h.revisions[1].content.is_none());
        assert_eq!(h.revisions[1].revid, 2);
    }
}
