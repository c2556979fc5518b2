//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{
    DEFAULT_ARCHIVE_PAGES, DEFAULT_BASE_DIR, DEFAULT_MAX_TOTAL_BYTES, DEFAULT_MIN_SNAPSHOT_BYTES,
    DEFAULT_NO_CACHE_PATHS, DEFAULT_SESSION_COOKIE_PREFIXES, DEFAULT_SWEEP_INTERVAL_SECS, Variant,
};

mod cli;

pub use cli::{
    CliArgs, Command, DropinAction, DropinArgs, GlobalOverrides, InvalidateArgs, PurgeArgs,
    SweepArgs, WarmArgs, WarmTarget,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "snapcache";
const DEFAULT_CONTENT_DIR: &str = "content";
const DEFAULT_CONTENT_INDEX: &str = "content/index.toml";
const DEFAULT_SITE_URL: &str = "http://127.0.0.1:3000/";
const DEFAULT_WARM_TIMEOUT_SECS: u64 = 10;
const DEFAULT_WARM_LIMIT: usize = 200;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub site: SiteSettings,
    pub warm: WarmSettings,
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
pub struct CacheSettings {
    pub base_directory: PathBuf,
    pub variants: Vec<Variant>,
    pub archive_page_count: NonZeroU32,
    pub max_total_bytes: u64,
    pub debug_headers: bool,
    pub no_cache_path_substrings: Vec<String>,
    pub min_snapshot_bytes: u64,
    pub session_cookie_prefixes: Vec<String>,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SiteSettings {
    /// Host content directory the early-serve manifest is installed into.
    pub content_dir: PathBuf,
    /// TOML index used to resolve entities to URLs.
    pub content_index: PathBuf,
    pub site_url: Url,
}

#[derive(Debug, Clone)]
pub struct WarmSettings {
    pub timeout: Duration,
    pub limit: usize,
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
        Environment::with_prefix("SNAPCACHE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.variants")
            .with_list_parse_key("cache.no_cache_path_substrings")
            .with_list_parse_key("cache.session_cookie_prefixes")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_global_overrides(&cli.overrides);
    if let Some(Command::Warm(args)) = cli.command.as_ref()
        && let Some(limit) = args.limit
    {
        raw.warm.limit = Some(limit);
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    site: RawSiteSettings,
    warm: RawWarmSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(dir) = overrides.cache_dir.as_ref() {
            self.cache.base_directory = Some(dir.clone());
        }
        if let Some(max) = overrides.max_total_bytes {
            self.cache.max_total_bytes = Some(max);
        }
        if let Some(index) = overrides.content_index.as_ref() {
            self.site.content_index = Some(index.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            site,
            warm,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            site: build_site_settings(site)?,
            warm: build_warm_settings(warm)?,
        })
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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let base_directory = cache
        .base_directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
    if base_directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.base_directory",
            "must not be empty",
        ));
    }

    let variants = match cache.variants {
        Some(values) => parse_variants(&values)?,
        None => vec![Variant::Gzip],
    };

    let archive_page_count = non_zero_u32(
        cache
            .archive_page_count
            .unwrap_or(DEFAULT_ARCHIVE_PAGES.into()),
        "cache.archive_page_count",
    )?;

    let sweep_secs = cache
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    if sweep_secs == 0 {
        return Err(LoadError::invalid(
            "cache.sweep_interval_seconds",
            "must be greater than zero",
        ));
    }

    // Configured entries extend the built-in list; they never replace it.
    let no_cache_path_substrings = clean_list(
        DEFAULT_NO_CACHE_PATHS
            .iter()
            .map(|path| path.to_string())
            .chain(cache.no_cache_path_substrings.unwrap_or_default())
            .collect(),
    );

    let session_cookie_prefixes = match cache.session_cookie_prefixes {
        Some(prefixes) => clean_list(prefixes),
        None => Vec::new(),
    };
    let session_cookie_prefixes = if session_cookie_prefixes.is_empty() {
        DEFAULT_SESSION_COOKIE_PREFIXES
            .iter()
            .map(|prefix| prefix.to_string())
            .collect()
    } else {
        session_cookie_prefixes
    };

    Ok(CacheSettings {
        base_directory,
        variants,
        archive_page_count,
        max_total_bytes: cache.max_total_bytes.unwrap_or(DEFAULT_MAX_TOTAL_BYTES),
        debug_headers: cache.debug_headers.unwrap_or(true),
        no_cache_path_substrings,
        min_snapshot_bytes: cache
            .min_snapshot_bytes
            .unwrap_or(DEFAULT_MIN_SNAPSHOT_BYTES),
        session_cookie_prefixes,
        sweep_interval: Duration::from_secs(sweep_secs),
    })
}

fn build_site_settings(site: RawSiteSettings) -> Result<SiteSettings, LoadError> {
    let raw_url = site
        .site_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SITE_URL.to_string());
    let site_url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("site.site_url", format!("failed to parse: {err}")))?;
    if !matches!(site_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "site.site_url",
            "scheme must be http or https",
        ));
    }

    Ok(SiteSettings {
        content_dir: site
            .content_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTENT_DIR)),
        content_index: site
            .content_index
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTENT_INDEX)),
        site_url,
    })
}

fn build_warm_settings(warm: RawWarmSettings) -> Result<WarmSettings, LoadError> {
    let timeout_secs = warm.timeout_seconds.unwrap_or(DEFAULT_WARM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "warm.timeout_seconds",
            "must be greater than zero",
        ));
    }
    Ok(WarmSettings {
        timeout: Duration::from_secs(timeout_secs),
        limit: warm.limit.unwrap_or(DEFAULT_WARM_LIMIT),
    })
}

fn parse_variants(values: &[String]) -> Result<Vec<Variant>, LoadError> {
    let mut variants = Vec::new();
    for value in values {
        if value.trim().is_empty() {
            continue;
        }
        let variant = Variant::from_str(value)
            .map_err(|reason| LoadError::invalid("cache.variants", reason))?;
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    if variants.is_empty() {
        return Err(LoadError::invalid(
            "cache.variants",
            "at least one variant is required",
        ));
    }
    Ok(variants)
}

fn clean_list(values: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !cleaned.iter().any(|seen| seen == value) {
            cleaned.push(value.to_string());
        }
    }
    cleaned
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

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    base_directory: Option<PathBuf>,
    variants: Option<Vec<String>>,
    archive_page_count: Option<u64>,
    max_total_bytes: Option<u64>,
    debug_headers: Option<bool>,
    no_cache_path_substrings: Option<Vec<String>>,
    min_snapshot_bytes: Option<u64>,
    session_cookie_prefixes: Option<Vec<String>>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    content_dir: Option<PathBuf>,
    content_index: Option<PathBuf>,
    site_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmSettings {
    timeout_seconds: Option<u64>,
    limit: Option<usize>,
}
