//! Configuration file handling.
//!
//! Looks for `.config/stockroom.styx` in the current directory or any parent
//! directory:
//!
//! ```text
//! database_url "postgres://localhost/storefront"
//! log "stockroom=debug"
//! ```

use facet::Facet;
use std::path::{Path, PathBuf};

/// Path of the config file, relative to the directory it lives in.
pub const CONFIG_PATH: &str = ".config/stockroom.styx";

/// Contents of `.config/stockroom.styx`.
#[derive(Facet, Debug, Default, Clone, PartialEq)]
pub struct Config {
    /// Postgres connection URL, used when neither `--database-url` nor
    /// `DATABASE_URL` is set.
    #[facet(default)]
    pub database_url: Option<String>,

    /// Default tracing filter, used when `RUST_LOG` is not set.
    #[facet(default)]
    pub log: Option<String>,
}

impl Config {
    /// Pick the database URL: command line first, then environment, then this file.
    pub fn resolve_database_url(
        &self,
        cli: Option<String>,
        env: Option<String>,
    ) -> Option<String> {
        let nonblank = |url: &String| !url.trim().is_empty();
        cli.filter(nonblank)
            .or_else(|| env.filter(nonblank))
            .or_else(|| self.database_url.clone().filter(nonblank))
    }
}

/// Parse a config file's contents.
pub fn parse(content: &str) -> Result<Config, ConfigError> {
    facet_styx::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Load configuration from `.config/stockroom.styx`, searching up the directory tree.
///
/// Returns `Ok(None)` if there is no config file anywhere.
pub fn load() -> Result<Option<(Config, PathBuf)>, ConfigError> {
    let cwd = std::env::current_dir().map_err(|e| ConfigError::Io(e.to_string()))?;
    load_from(&cwd)
}

/// Load configuration starting from a specific directory.
pub fn load_from(start: &Path) -> Result<Option<(Config, PathBuf)>, ConfigError> {
    let Some(config_path) = find_config_file(start) else {
        return Ok(None);
    };
    let content =
        std::fs::read_to_string(&config_path).map_err(|e| ConfigError::Io(e.to_string()))?;
    let config = parse(&content)?;
    Ok(Some((config, config_path)))
}

fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_PATH);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read .config/stockroom.styx: {0}")]
    Io(String),
    #[error("failed to parse .config/stockroom.styx: {0}")]
    Parse(String),
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err.to_string())
    }
}
