//! wikirev - batch revision fetcher for Wikipedia and other MediaWiki wikis
//!
//! Downloads the latest revision of many articles, or the complete revision
//! history of each, and writes verified histories as JSON or XML.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use wikirev_core::CancelFlag;

mod clean;
mod cmd;
mod config;
mod output;

use config::Config;

#[derive(Parser)]
#[command(name = "wikirev")]
#[command(about = "Batch revision fetcher for MediaWiki wikis")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./wikirev.toml or ~/.config/wikirev/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch latest revisions or full histories
    Fetch(cmd::fetch::FetchArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            log::error!("Fatal error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(wikirev_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug, progress bars show activity
    //   non-TTY: info unless --debug, logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = is_tty && !cli.debug;
    wikirev_core::init_logging(quiet, cli.debug, multi)?;

    let config = if let Some(path) = &cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Fetch(args) => {
            let cancel = CancelFlag::new();
            setup_signal_handler(&cancel)?;
            cmd::fetch::run(args, &config, &progress, &cancel)
        }
        Command::Config => {
            print_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// First SIGINT/SIGTERM cancels the batch; a second one exits immediately
fn setup_signal_handler(cancel: &CancelFlag) -> Result<()> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let cancel = cancel.clone();
        // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
        unsafe {
            signal_hook::low_level::register(signal, move || {
                if cancel.swap_cancel() {
                    std::process::exit(130);
                }
            })?;
        }
    }
    Ok(())
}

fn print_config(config: &Config) {
    use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

    let fetch = &config.fetch;
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    table.add_row(vec!["Language", &fetch.lang]);
    table.add_row(vec!["Action API", &fetch.api_url()]);
    table.add_row(vec!["REST API", &fetch.rest_url()]);
    table.add_row(vec!["User agent", &fetch.user_agent]);
    table.add_row(vec!["Mode", fetch.mode.name()]);
    table.add_row(vec!["Concurrency", &fetch.concurrency.to_string()]);
    table.add_row(vec![
        "Rate",
        &format!(
            "{} req/s (spacing {}-{}ms)",
            fetch.requests_per_second,
            fetch.min_spacing().as_millis(),
            fetch.backoff.ceiling_ms
        ),
    ]);
    table.add_row(vec![
        "Page size",
        &format!(
            "{} revisions, {} titles",
            fetch.page_size, fetch.latest_batch_size
        ),
    ]);
    table.add_row(vec![
        "Latest text",
        &format!(
            "{}{}",
            fetch.latest_content.name(),
            if fetch.intro_only { " (intro only)" } else { "" }
        ),
    ]);
    table.add_row(vec![
        "Retries",
        &format!(
            "{} (base {}ms), {} throttles",
            fetch.max_retries, fetch.retry_base_ms, fetch.max_throttle_retries
        ),
    ]);
    table.add_row(vec![
        "Maxlag",
        &fetch
            .maxlag
            .map_or_else(|| "off".to_string(), |s| format!("{s}s")),
    ]);
    table.add_row(vec![
        "Verify count",
        if fetch.verify_count { "yes" } else { "no" },
    ]);
    table.add_row(vec![
        "Timeouts",
        &format!(
            "connect {}s, read {}s",
            fetch.connect_timeout_secs, fetch.read_timeout_secs
        ),
    ]);
    table.add_row(vec!["Output directory", &config.output.dir.display().to_string()]);
    table.add_row(vec!["Output format", config.output.format.extension()]);
    table.add_row(vec![
        "Clean text",
        if config.output.clean { "yes" } else { "no" },
    ]);

    eprintln!("\n{table}");
}
