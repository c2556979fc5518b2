//! A host that only has the installed manifest can serve what the full
//! engine captured.

use axum::http::Request;
use snapcache::cache::{
    CacheConfig, DropinInstaller, EarlyOutcome, EarlyReader, EarlySettings, EarlyServeManifest,
    Presence, RequestFacts, SnapshotWriter, Variant, normalize_url,
};
use tempfile::TempDir;

fn home_request() -> RequestFacts {
    let (parts, ()) = Request::builder()
        .uri("/")
        .header("host", "example.com")
        .header("x-forwarded-proto", "https")
        .header("accept-encoding", "br, gzip")
        .body(())
        .unwrap()
        .into_parts();
    RequestFacts::from_parts(&parts, "http")
}

#[test]
fn manifest_alone_is_enough_to_serve() {
    let dir = TempDir::new().unwrap();
    let content_dir = dir.path().join("content");
    let config = CacheConfig {
        base_directory: dir.path().join("snapshots"),
        variants: vec![Variant::Brotli],
        min_snapshot_bytes: 0,
        ..Default::default()
    };
    SnapshotWriter::new(&config).write(
        &normalize_url("https://example.com/").unwrap(),
        "<html><body>home</body></html>",
    );

    let installer = DropinInstaller::new(&content_dir);
    let state = installer
        .install(&EarlyServeManifest::from_config(&config))
        .unwrap();
    assert!(state.installed);
    assert_eq!(installer.status().unwrap().presence, Presence::Ours);

    let manifest = EarlyServeManifest::load(&content_dir).unwrap();
    let reader = EarlyReader::new(EarlySettings::from(manifest));
    assert!(matches!(
        reader.lookup(&home_request()),
        EarlyOutcome::Hit {
            variant: Variant::Brotli,
            ..
        }
    ));
}

#[test]
fn foreign_bootstrap_survives_install_and_uninstall() {
    let dir = TempDir::new().unwrap();
    let installer = DropinInstaller::new(dir.path());
    std::fs::write(installer.manifest_path(), "# someone else's file\n").unwrap();

    let state = installer
        .install(&EarlyServeManifest::from_config(&CacheConfig::default()))
        .unwrap();
    assert!(!state.installed);
    assert_eq!(state.reason.as_deref(), Some(snapcache::cache::dropin::REASON_FOREIGN));

    assert!(!installer.uninstall().unwrap());
    assert_eq!(
        std::fs::read_to_string(installer.manifest_path()).unwrap(),
        "# someone else's file\n"
    );
}
