//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use wikirev_core::FetchConfig;

use crate::output::OutputFormat;

/// Global configuration for wikirev
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub fetch: FetchConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub format: OutputFormat,
    /// Run the wikitext cleaner before writing
    pub clean: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            format: OutputFormat::Json,
            clean: false,
        }
    }
}

static ENV_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Expand every `${VAR}` reference; unset variables expand to nothing
fn expand_env_vars(s: &str) -> String {
    ENV_REF
        .replace_all(s, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| {
                log::warn!("Environment variable {} is not set", &caps[1]);
                String::new()
            })
        })
        .into_owned()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./wikirev.toml (current directory)
    /// 2. ~/.config/wikirev/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("wikirev.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "wikirev") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.fetch.user_agent = expand_env_vars(&config.fetch.user_agent);
        Ok(config)
    }
}
