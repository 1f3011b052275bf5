//! Wikitext cleaner: markup stripped, trailing reference sections cut,
//! numbers and citation marks dropped.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use wikirev_core::{CleanError, TextCleaner};

/// Template nesting beyond this is treated as malformed input
const MAX_TEMPLATE_DEPTH: usize = 32;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

static COMMENT: LazyLock<Regex> = LazyLock::new(|| re(r"(?s)<!--.*?-->"));
static REF_EMPTY: LazyLock<Regex> = LazyLock::new(|| re(r"<ref[^>]*/>"));
static REF_BLOCK: LazyLock<Regex> = LazyLock::new(|| re(r"(?s)<ref[^>]*>.*?</ref\s*>"));
static TEMPLATE: LazyLock<Regex> = LazyLock::new(|| re(r"\{\{[^{}]*\}\}"));
static TABLE: LazyLock<Regex> = LazyLock::new(|| re(r"(?s)\{\|.*?\|\}"));
static MEDIA_LINK: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\[\[(?:File|Image|Category|Archivo|Imagen|Categoría):(?:[^\[\]]|\[\[[^\]]*\]\])*\]\]")
});
static WIKI_LINK: LazyLock<Regex> = LazyLock::new(|| re(r"\[\[(?:[^|\]]*\|)?([^\]]*)\]\]"));
static EXTERNAL_LINK: LazyLock<Regex> =
    LazyLock::new(|| re(r"\[(?:https?:)?//[^\s\]]+\s*([^\]]*)\]"));
static HEADING: LazyLock<Regex> = LazyLock::new(|| re(r"(?m)^=+[ \t]*(.*?)[ \t]*=+[ \t]*$"));
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| re(r"'{2,}"));
static TAG: LazyLock<Regex> = LazyLock::new(|| re(r"</?[A-Za-z][^>]*>"));
static TRAILING_SECTION: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^(?:Notes|External links|References)[ \t]*$"));
static CITATION: LazyLock<Regex> = LazyLock::new(|| re(r"\[[0-9]+\]"));

/// Regex-based wikitext cleaner
#[derive(Debug, Default, Clone, Copy)]
pub struct WikitextCleaner;

impl WikitextCleaner {
    pub fn new() -> Self {
        Self
    }
}

fn strip_templates(text: &str) -> Result<String, CleanError> {
    let mut text = text.to_string();
    for _ in 0..MAX_TEMPLATE_DEPTH {
        match TEMPLATE.replace_all(&text, "") {
            Cow::Borrowed(_) => return Ok(text),
            Cow::Owned(stripped) => text = stripped,
        }
    }
    if TEMPLATE.is_match(&text) {
        return Err(CleanError(format!(
            "templates nested deeper than {MAX_TEMPLATE_DEPTH}"
        )));
    }
    Ok(text)
}

/// Plain text of `raw` with markup removed (sections kept)
fn strip_markup(raw: &str) -> Result<String, CleanError> {
    let text = COMMENT.replace_all(raw, "");
    let text = REF_EMPTY.replace_all(&text, "");
    let text = REF_BLOCK.replace_all(&text, "");
    let text = strip_templates(&text)?;
    let text = TABLE.replace_all(&text, "");
    let text = MEDIA_LINK.replace_all(&text, "");
    let text = WIKI_LINK.replace_all(&text, "$1");
    let text = EXTERNAL_LINK.replace_all(&text, "$1");
    let text = HEADING.replace_all(&text, "$1");
    let text = EMPHASIS.replace_all(&text, "");
    let text = TAG.replace_all(&text, "");
    Ok(text.into_owned())
}

fn is_numeric_token(token: &str) -> bool {
    token.chars().all(char::is_numeric)
}

impl TextCleaner for WikitextCleaner {
    fn clean(&self, raw: &str) -> Result<String, CleanError> {
        let text = strip_markup(raw)?;
        let body = match TRAILING_SECTION.find(&text) {
            Some(m) => &text[..m.start()],
            None => text.as_str(),
        };

        let joined = body
            .split_whitespace()
            .filter(|token| !is_numeric_token(token))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(CITATION.replace_all(&joined, "").into_owned())
    }
}
