//! Operator commands.
//!
//! Each command resolves what it needs from [`Settings`], calls into the
//! engine and logs a one-line summary.

use std::sync::Arc;

use tracing::info;

use crate::{
    cache::{
        CacheConfig, CacheTrigger, ContentSource, DropinInstaller, DropinState, DropinStatus,
        EarlyServeManifest, EventQueue, Invalidator, PurgeConsumer, PurgeReport, SnapshotStore,
        SweepReport, spawn_quota_sweeper, sweep,
    },
    config::{DropinAction, InvalidateArgs, PurgeArgs, Settings, SweepArgs, WarmArgs},
    infra::{
        content_index::ContentIndex,
        warmer::{CacheWarmer, WarmReport},
    },
};

use super::error::AppError;

const TARGET: &str = "snapcache::commands";

/// Outcome of a `dropin` subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropinOutcome {
    Installed(DropinState),
    Uninstalled { removed: bool },
    Status(DropinStatus),
}

/// Engine objects shared by the purge-style commands.
pub struct CacheContext {
    pub config: Arc<CacheConfig>,
    pub trigger: CacheTrigger,
}

impl CacheContext {
    pub fn new(settings: &Settings, source: Arc<dyn ContentSource>) -> Self {
        let config = Arc::new(CacheConfig::from(&settings.cache));
        let invalidator = Invalidator::new(
            source,
            SnapshotStore::new(config.base_directory.clone()),
            config.archive_page_count,
        );
        let queue = Arc::new(EventQueue::new());
        let consumer = Arc::new(PurgeConsumer::new(queue.clone(), invalidator));
        Self {
            config,
            trigger: CacheTrigger::new(queue, consumer),
        }
    }

    pub fn invalidator(&self) -> &Invalidator {
        self.trigger.consumer().invalidator()
    }
}

fn load_index(settings: &Settings) -> Result<ContentIndex, AppError> {
    Ok(ContentIndex::load(
        &settings.site.content_index,
        &settings.site.site_url,
    )?)
}

/// Context for commands that never resolve entities.
fn url_only_context(settings: &Settings) -> CacheContext {
    CacheContext::new(
        settings,
        Arc::new(ContentIndex::empty(&settings.site.site_url)),
    )
}

pub fn purge(settings: &Settings, args: &PurgeArgs) -> Result<PurgeReport, AppError> {
    let context = url_only_context(settings);
    let report = context.invalidator().invalidate_by_url(&args.url)?;
    info!(
        target = TARGET,
        op = "purge",
        result = "ok",
        url = %args.url,
        report = %report,
        "Purged URL"
    );
    Ok(report)
}

pub fn purge_all(settings: &Settings) -> Result<(), AppError> {
    let context = url_only_context(settings);
    context.invalidator().purge_all()?;
    Ok(())
}

pub fn invalidate(settings: &Settings, args: &InvalidateArgs) -> Result<PurgeReport, AppError> {
    let context = CacheContext::new(settings, Arc::new(load_index(settings)?));
    let report = match (args.entity, args.global) {
        (Some(id), false) => context.trigger.entity_saved(id),
        (None, true) => context.trigger.global_changed("operator"),
        _ => {
            return Err(AppError::validation(
                "invalidate requires exactly one of --entity or --global",
            ));
        }
    };
    let report = report.unwrap_or_default();
    info!(
        target = TARGET,
        op = "invalidate",
        result = "ok",
        report = %report,
        "Invalidation finished"
    );
    Ok(report)
}

/// One sweep, or with `--watch` a sweep on every interval until interrupted.
pub async fn sweep_cache(settings: &Settings, args: &SweepArgs) -> Result<SweepReport, AppError> {
    let config = Arc::new(CacheConfig::from(&settings.cache));
    let root = config.base_directory.clone();
    let max_bytes = config.max_total_bytes;
    let report = tokio::task::spawn_blocking(move || sweep(&root, max_bytes))
        .await
        .map_err(|err| AppError::unexpected(format!("sweep task failed: {err}")))?;

    if args.watch {
        info!(
            target = TARGET,
            op = "sweep",
            interval_secs = config.sweep_interval.as_secs(),
            "Watching; press Ctrl-C to stop"
        );
        let handle = spawn_quota_sweeper(config);
        let stopped = tokio::signal::ctrl_c().await;
        handle.abort();
        let _ = handle.await;
        stopped.map_err(|err| AppError::unexpected(format!("signal handler failed: {err}")))?;
    }
    Ok(report)
}

pub async fn warm(settings: &Settings, args: &WarmArgs) -> Result<WarmReport, AppError> {
    let index = load_index(settings)?;
    let limit = args.limit.unwrap_or(settings.warm.limit);
    let urls = index.warm_urls(args.what, limit);
    info!(
        target = TARGET,
        op = "warm",
        what = ?args.what,
        urls = urls.len(),
        "Warming"
    );
    let warmer = CacheWarmer::new(settings.warm.timeout)?;
    Ok(warmer.warm(&urls).await)
}

pub fn dropin(settings: &Settings, action: DropinAction) -> Result<DropinOutcome, AppError> {
    let installer = DropinInstaller::new(settings.site.content_dir.clone());
    let outcome = match action {
        DropinAction::Install => {
            let config = CacheConfig::from(&settings.cache);
            let state = installer.install(&EarlyServeManifest::from_config(&config))?;
            DropinOutcome::Installed(state)
        }
        DropinAction::Uninstall => DropinOutcome::Uninstalled {
            removed: installer.uninstall()?,
        },
        DropinAction::Status => DropinOutcome::Status(installer.status()?),
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::num::NonZeroU32;
    use std::time::Duration;

    use tempfile::TempDir;
    use tracing::level_filters::LevelFilter;
    use url::Url;

    use super::*;
    use crate::cache::{CacheKey, Presence, Variant, normalize_url};
    use crate::config::{
        CacheSettings, LogFormat, LoggingSettings, SiteSettings, WarmSettings, WarmTarget,
    };

    fn settings(dir: &TempDir) -> Settings {
        Settings {
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
            cache: CacheSettings {
                base_directory: dir.path().join("snapshots"),
                variants: vec![Variant::Gzip],
                archive_page_count: NonZeroU32::new(2).unwrap(),
                max_total_bytes: 0,
                debug_headers: true,
                no_cache_path_substrings: Vec::new(),
                min_snapshot_bytes: 1024,
                session_cookie_prefixes: vec!["wordpress_logged_in_".to_string()],
                sweep_interval: Duration::from_secs(60),
            },
            site: SiteSettings {
                content_dir: dir.path().join("content"),
                content_index: dir.path().join("index.toml"),
                site_url: Url::parse("https://example.com/").unwrap(),
            },
            warm: WarmSettings {
                timeout: Duration::from_secs(1),
                limit: 10,
            },
        }
    }

    fn plant(settings: &Settings, url: &str) -> std::path::PathBuf {
        let key = CacheKey::derive(&normalize_url(url).unwrap());
        let path = key.snapshot_path(Variant::Gzip, &settings.cache.base_directory);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"snapshot").unwrap();
        path
    }

    #[test]
    fn purge_removes_only_the_named_url() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let target = plant(&settings, "https://example.com/about-us/");
        let other = plant(&settings, "https://example.com/");

        let report = purge(
            &settings,
            &PurgeArgs {
                url: "https://example.com/about-us".to_string(),
            },
        )
        .unwrap();

        assert_eq!(report.files_removed, 1);
        assert!(!target.exists());
        assert!(other.exists());
    }

    #[test]
    fn invalidate_entity_uses_content_index() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        fs::write(
            &settings.site.content_index,
            "[[entities]]\nid = 5\nurl = \"/hello/\"\nkind = \"post\"\n",
        )
        .unwrap();
        let post = plant(&settings, "https://example.com/hello/");
        let page_two = plant(&settings, "https://example.com/page/2/");

        let report = invalidate(
            &settings,
            &InvalidateArgs {
                entity: Some(5),
                global: false,
            },
        )
        .unwrap();

        assert_eq!(report.urls, 4);
        assert!(!post.exists());
        assert!(!page_two.exists());
    }

    #[test]
    fn invalidate_without_index_is_an_error() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let err = invalidate(
            &settings,
            &InvalidateArgs {
                entity: None,
                global: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Infra(_)));
    }

    #[test]
    fn dropin_round_trip() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);

        match dropin(&settings, DropinAction::Install).unwrap() {
            DropinOutcome::Installed(state) => assert!(state.installed && state.ours),
            other => panic!("unexpected outcome {other:?}"),
        }
        match dropin(&settings, DropinAction::Status).unwrap() {
            DropinOutcome::Status(status) => assert_eq!(status.presence, Presence::Ours),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            dropin(&settings, DropinAction::Uninstall).unwrap(),
            DropinOutcome::Uninstalled { removed: true }
        );
    }

    #[tokio::test]
    async fn one_shot_sweep_honours_budget() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        plant(&settings, "https://example.com/a/");
        plant(&settings, "https://example.com/b/");
        settings.cache.max_total_bytes = 8;

        let report = sweep_cache(&settings, &SweepArgs { watch: false })
            .await
            .unwrap();
        assert_eq!(report.total_before, 16);
        assert_eq!(report.evicted_files, 1);
    }

    #[tokio::test]
    async fn warm_posts_with_empty_index_requests_nothing() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.site.site_url = Url::parse("http://127.0.0.1:9/").unwrap();
        fs::write(&settings.site.content_index, "").unwrap();

        let report = warm(
            &settings,
            &WarmArgs {
                what: WarmTarget::Posts,
                limit: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.requested, 0);
    }
}
