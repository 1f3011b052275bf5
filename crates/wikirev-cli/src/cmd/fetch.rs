//! Fetch subcommand - download latest revisions or full histories

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use wikirev_core::{
    ArticleResult, ArticleTarget, BatchReport, CancelFlag, CompletedHistory, FetchConfig,
    HttpTransport, LatestContent, Mode, Orchestrator, OutcomeSink, SharedProgress, clean_history,
    fmt_num,
};

use crate::clean::WikitextCleaner;
use crate::config::Config;
use crate::output::{self, OutputFormat};

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Article titles (`pageid:N` selects a page id)
    pub titles: Vec<String>,

    /// Read titles from a file, one per line (`#` starts a comment)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// What to fetch for each article
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Wiki language code (en, es, ...)
    #[arg(short, long)]
    pub lang: Option<String>,

    /// Output directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output file format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Also write a cleaned copy of each history (`{title}_{lang}_clean.{ext}`)
    #[arg(long)]
    pub clean: bool,

    /// Latest mode: plain-text extracts instead of wikitext
    #[arg(long)]
    pub extract: bool,

    /// Latest mode: only the introduction of each extract (implies --extract)
    #[arg(long)]
    pub intro_only: bool,

    /// Maximum simultaneous requests
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Requests per second across the whole batch
    #[arg(long)]
    pub rps: Option<f64>,

    /// Revisions per full-history request (1-50)
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Maximum retry attempts for transient failures
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Skip the edit-count check on assembled histories
    #[arg(long)]
    pub no_verify: bool,
}

#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum ModeArg {
    /// Current revision of each article
    Latest,
    /// Every revision, oldest first
    History,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Latest => Mode::LatestRevision,
            ModeArg::History => Mode::FullHistory,
        }
    }
}

impl FetchArgs {
    /// Config file values with command-line flags applied on top
    fn fetch_config(&self, base: &FetchConfig) -> FetchConfig {
        let mut config = base.clone();
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(lang) = &self.lang {
            config.lang = lang.clone();
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(rps) = self.rps {
            config.requests_per_second = rps;
        }
        if let Some(size) = self.page_size {
            config.page_size = size;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if self.no_verify {
            config.verify_count = false;
        }
        if self.extract || self.intro_only {
            config.latest_content = LatestContent::Extract;
        }
        if self.intro_only {
            config.intro_only = true;
        }
        config
    }
}

fn read_title_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read title file: {}", path.display()))?;
    Ok(parse_title_lines(&content))
}

fn parse_title_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

fn collect_targets(args: &FetchArgs) -> Result<Vec<ArticleTarget>> {
    let mut names = args.titles.clone();
    if let Some(path) = &args.file {
        names.extend(read_title_file(path)?);
    }
    let targets: Vec<ArticleTarget> = names
        .iter()
        .map(|s| ArticleTarget::parse(s))
        .filter(|t| !matches!(t, ArticleTarget::Title(s) if s.is_empty()))
        .collect();
    if targets.is_empty() {
        anyhow::bail!("No articles given (pass titles or --file)");
    }
    Ok(targets)
}

pub fn run(
    args: FetchArgs,
    config: &Config,
    progress: &SharedProgress,
    cancel: &CancelFlag,
) -> Result<ExitCode> {
    let targets = collect_targets(&args)?;
    let fetch_config = args.fetch_config(&config.fetch);
    let transport = HttpTransport::new(&fetch_config).context("Failed to build HTTP client")?;
    let orchestrator = Orchestrator::try_new(fetch_config, transport)?
        .with_cancel(cancel.clone())
        .with_progress(progress.clone());
    let fetch_config = orchestrator.config();

    let output_dir = args.output.clone().unwrap_or_else(|| config.output.dir.clone());
    let format = args.format.unwrap_or(config.output.format);
    let cleaner = (args.clean || config.output.clean).then(WikitextCleaner::new);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    log::info!("Fetching {} articles from {}", targets.len(), fetch_config.api_url());
    log::info!("  Mode: {}", fetch_config.mode);
    log::info!("  Output: {} ({format:?})", output_dir.display());

    let lang = &fetch_config.lang;
    let sink = output::sink_for(format, &output_dir, lang, "");
    let clean_sink = output::sink_for(format, &output_dir, lang, output::CLEAN_SUFFIX);
    let cleaning = cleaner.as_ref().map(|c| (c, clean_sink.as_ref()));

    let written = AtomicUsize::new(0);
    let write_failures = AtomicUsize::new(0);
    let report = orchestrator.run_with(&targets, |result: &ArticleResult| {
        let Some(history) = result.outcome.history() else {
            return;
        };
        match write_history(history, sink.as_ref(), cleaning) {
            Ok(()) => {
                written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!("{}: failed to write output: {e}", history.display_title());
                write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    })?;

    let written = written.into_inner();
    let write_failures = write_failures.into_inner();
    print_summary(&report, fetch_config.mode, written, &output_dir);
    print_failures(&report);

    if cancel.is_cancelled() {
        log::warn!("Cancelled, {} articles unfinished", report.cancelled());
        return Ok(ExitCode::from(130));
    }
    if !report.all_complete() || write_failures > 0 {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

/// Write the fetched history, plus a cleaned copy when a cleaner is given
fn write_history(
    history: &CompletedHistory,
    sink: &dyn OutcomeSink,
    cleaning: Option<(&WikitextCleaner, &dyn OutcomeSink)>,
) -> std::io::Result<()> {
    sink.write(history)?;
    let Some((cleaner, clean_sink)) = cleaning else {
        return Ok(());
    };
    let mut cleaned = history.clone();
    let stats = clean_history(&mut cleaned, cleaner);
    log::debug!(
        "{}: cleaned {} revisions ({} failed, {} without text)",
        history.display_title(),
        stats.cleaned,
        stats.failed,
        stats.skipped
    );
    clean_sink.write(&cleaned)
}

/// Print the batch summary table on stderr
fn print_summary(report: &BatchReport, mode: Mode, written: usize, output_dir: &Path) {
    let rows = [
        ("Mode", mode.to_string()),
        (
            "Articles",
            format!(
                "{}/{} complete ({} failed, {} cancelled)",
                report.completed(),
                report.results.len(),
                report.failed() - report.cancelled(),
                report.cancelled()
            ),
        ),
        ("Revisions", fmt_num(report.revisions())),
        ("Written", format!("{written} files to {}", output_dir.display())),
        ("Time", format!("{:.1}s", report.elapsed.as_secs_f64())),
    ];

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Fetch").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
    for (label, value) in rows {
        table.add_row(vec![Cell::new(label), Cell::new(value)]);
    }
    eprintln!("\n{table}");
}

/// List every article that did not complete
fn print_failures(report: &BatchReport) {
    let failures: Vec<_> = report
        .results
        .iter()
        .filter_map(|r| r.outcome.error().map(|e| (r, e)))
        .collect();
    if failures.is_empty() {
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Article").fg(Color::Red),
            Cell::new("Kind").fg(Color::Red),
            Cell::new("Detail").fg(Color::Red),
        ]);
    for (result, error) in failures {
        table.add_row(vec![
            Cell::new(&result.target),
            Cell::new(error.kind()),
            Cell::new(error),
        ]);
    }
    eprintln!("\n{table}");
}
