use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};

/// Command-line arguments for the snapcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "snapcache",
    version,
    about = "Filesystem full-page snapshot cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SNAPCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Delete every variant cached for one URL.
    Purge(PurgeArgs),
    /// Remove the whole cache tree and recreate an empty root.
    #[command(name = "purge-all")]
    PurgeAll,
    /// Evict the oldest snapshots until the tree fits the byte budget.
    Sweep(SweepArgs),
    /// Run the invalidation fan-out for an entity or for site-wide changes.
    Invalidate(InvalidateArgs),
    /// Request candidate URLs so their snapshots are rebuilt.
    Warm(WarmArgs),
    /// Manage the early-serve manifest in the host content directory.
    Dropin(DropinArgs),
}

/// Overrides accepted before any subcommand.
#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the cache root directory.
    #[arg(long = "cache-dir", value_name = "PATH", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Override the disk budget in bytes (0 disables the sweep).
    #[arg(long = "max-total-bytes", value_name = "BYTES", global = true)]
    pub max_total_bytes: Option<u64>,

    /// Override the content index used to resolve entities.
    #[arg(long = "content-index", value_name = "PATH", global = true)]
    pub content_index: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    /// Absolute URL whose snapshots should be deleted.
    #[arg(long, value_name = "URL")]
    pub url: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SweepArgs {
    /// Keep running and sweep on the configured interval.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub watch: bool,
}

#[derive(Debug, Args, Clone)]
#[group(required = true, multiple = false)]
pub struct InvalidateArgs {
    /// Entity whose canonical, archive and term pages should be purged.
    #[arg(long, value_name = "ID")]
    pub entity: Option<u64>,

    /// Purge the site root and the top-level listing.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub global: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum WarmTarget {
    #[default]
    All,
    Home,
    Posts,
    Archives,
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    /// Which URLs to request.
    #[arg(long, value_enum, default_value_t = WarmTarget::All)]
    pub what: WarmTarget,

    /// Maximum number of URLs to request; overrides `warm.limit`.
    #[arg(long, value_name = "COUNT")]
    pub limit: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct DropinArgs {
    #[command(subcommand)]
    pub action: DropinAction,
}

#[derive(Debug, Subcommand, Clone, Copy, PartialEq, Eq)]
pub enum DropinAction {
    /// Write the manifest unless a foreign file occupies its place.
    Install,
    /// Remove the manifest if snapcache owns it.
    Uninstall,
    /// Report whether the manifest is present and who owns it.
    Status,
}
