use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    Extension, Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Html,
    routing::get,
};
use metrics_util::debugging::DebuggingRecorder;
use snapcache::cache::{
    CacheConfig, CacheTrigger, CaptureState, EarlyServeState, EarlySettings, EventQueue,
    Invalidator, PurgeConsumer, SnapshotStore, Variant, ViewKind, install_layers, metric_names,
    sweep,
};
use snapcache::infra::content_index::ContentIndex;
use tempfile::TempDir;
use tower::ServiceExt;
use url::Url;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        base_directory: dir.path().join("snapshots"),
        variants: vec![Variant::Gzip],
        min_snapshot_bytes: 0,
        max_total_bytes: 1,
        ..Default::default()
    };

    // Early miss, capture write, then early hit through the layers.
    let router = Router::new().route(
        "/",
        get(|| async { (Extension(ViewKind::FrontPage), Html("<p>home</p>")) }),
    );
    let app = install_layers(
        router,
        EarlyServeState::new(EarlySettings::from(&config), "https"),
        CaptureState::new(&config, "https"),
    );
    for _ in 0..2 {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/")
            .header(header::HOST, "example.com")
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Invalidation through the event pipeline.
    let site = Url::parse("https://example.com/").unwrap();
    let invalidator = Invalidator::new(
        Arc::new(ContentIndex::empty(&site)),
        SnapshotStore::new(config.base_directory.clone()),
        config.archive_page_count,
    );
    let queue = Arc::new(EventQueue::new());
    let trigger = CacheTrigger::new(
        queue.clone(),
        Arc::new(PurgeConsumer::new(queue, invalidator)),
    );
    trigger.entity_saved(1);

    // Quota sweep over budget.
    std::fs::create_dir_all(&config.base_directory).unwrap();
    std::fs::write(config.base_directory.join("stale.gz"), b"stale").unwrap();
    sweep(&config.base_directory, config.max_total_bytes);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        metric_names::METRIC_EARLY_TOTAL,
        metric_names::METRIC_WRITE_TOTAL,
        metric_names::METRIC_WRITE_MS,
        metric_names::METRIC_PURGE_URLS_TOTAL,
        metric_names::METRIC_PURGE_FILES_TOTAL,
        metric_names::METRIC_CONSUME_MS,
        metric_names::METRIC_SWEEP_EVICTED_TOTAL,
        metric_names::METRIC_SWEEP_MS,
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
