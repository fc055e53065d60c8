//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;
use crate::domain::node::NodeId;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "canopy";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;

/// Command-line arguments for the canopy binary.
#[derive(Debug, Parser)]
#[command(name = "canopy", version, about = "Category tree queries and cache maintenance")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CANOPY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the category forest as JSON.
    Tree(TreeArgs),
    /// Print the root-to-node chain of one category.
    Breadcrumbs(BreadcrumbsArgs),
    /// Print node counts per depth level.
    Stats,
    /// Populate the cache with the tree, depth statistics and breadcrumbs.
    #[command(name = "warm-cache")]
    WarmCache(WarmCacheArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct TreeArgs {
    /// Hide inactive categories and everything below them.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub active_only: bool,
}

#[derive(Debug, Args, Clone)]
pub struct BreadcrumbsArgs {
    #[arg(value_name = "ID")]
    pub id: NodeId,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WarmCacheArgs {
    /// Warm the active-only tree instead of the full one.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub active_only: bool,

    /// Report what would be warmed without computing anything.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub dry_run: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Emit JSON logs instead of the compact format.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT", global = true)]
    pub database_max_connections: Option<u32>,

    /// Turn the read-through cache on or off.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub cache_enabled: Option<bool>,

    /// Override the debounce window in milliseconds.
    #[arg(long = "cache-debounce-window-ms", value_name = "MILLIS", global = true)]
    pub cache_debounce_window_ms: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

/// Validated `[cache]` table. See [`CacheConfig`] for field meanings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub namespace: String,
    pub entry_ttl_secs: u64,
    pub debounce_window_ms: u64,
    pub memory_capacity: usize,
    pub tagged_store: bool,
    pub flush_max_attempts: u32,
    pub flush_backoff_secs: Vec<u64>,
    pub flush_timeout_secs: u64,
    pub worker_concurrency: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("CANOPY")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.flush_backoff_secs")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(window) = overrides.cache_debounce_window_ms {
            self.cache.debounce_window_ms = Some(window);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            cache,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            cache: build_cache_settings(cache)?,
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(&self.cache)
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_value = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = non_zero_u32(max_value.into(), "database.max_connections")?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let namespace = cache.namespace.unwrap_or(defaults.namespace);
    if namespace.trim().is_empty() {
        return Err(LoadError::invalid("cache.namespace", "must not be empty"));
    }

    let entry_ttl_secs = cache.entry_ttl_secs.unwrap_or(defaults.entry_ttl_secs);
    if entry_ttl_secs == 0 {
        return Err(LoadError::invalid(
            "cache.entry_ttl_secs",
            "must be greater than zero",
        ));
    }

    let debounce_window_ms = cache
        .debounce_window_ms
        .unwrap_or(defaults.debounce_window_ms);
    if debounce_window_ms == 0 {
        return Err(LoadError::invalid(
            "cache.debounce_window_ms",
            "must be greater than zero",
        ));
    }

    let flush_max_attempts = cache
        .flush_max_attempts
        .unwrap_or(defaults.flush_max_attempts);
    if flush_max_attempts == 0 {
        return Err(LoadError::invalid(
            "cache.flush_max_attempts",
            "must be at least one",
        ));
    }

    let flush_backoff_secs = cache
        .flush_backoff_secs
        .unwrap_or(defaults.flush_backoff_secs);
    if flush_backoff_secs.is_empty() {
        return Err(LoadError::invalid(
            "cache.flush_backoff_secs",
            "must list at least one delay",
        ));
    }

    let flush_timeout_secs = cache
        .flush_timeout_secs
        .unwrap_or(defaults.flush_timeout_secs);
    if flush_timeout_secs == 0 {
        return Err(LoadError::invalid(
            "cache.flush_timeout_secs",
            "must be greater than zero",
        ));
    }

    let memory_capacity = cache.memory_capacity.unwrap_or(defaults.memory_capacity);
    let worker_concurrency = cache
        .worker_concurrency
        .unwrap_or(defaults.worker_concurrency);
    if worker_concurrency == 0 {
        return Err(LoadError::invalid(
            "cache.worker_concurrency",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        namespace,
        entry_ttl_secs,
        debounce_window_ms,
        memory_capacity,
        tagged_store: cache.tagged_store.unwrap_or(defaults.tagged_store),
        flush_max_attempts,
        flush_backoff_secs,
        flush_timeout_secs,
        worker_concurrency,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    namespace: Option<String>,
    entry_ttl_secs: Option<u64>,
    debounce_window_ms: Option<u64>,
    memory_capacity: Option<usize>,
    tagged_store: Option<bool>,
    flush_max_attempts: Option<u32>,
    flush_backoff_secs: Option<Vec<u64>>,
    flush_timeout_secs: Option<u64>,
    worker_concurrency: Option<usize>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
