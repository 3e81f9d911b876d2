/// End-to-end pipeline tests against a mock mirror: index refresh, on-demand
/// and bulk downloads, retries, auto-unpack, and the upgrade notifier.
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use aegis_test_utils::{MockMirror, TEST_SIGNER, public_key_hex, sign_index, sign_resource};
use aegis_updates::{
    AddVersionOpts, IndexSpec, Registry, RegistryConfig, SignaturePolicy, TrustStore,
    UpdateError, VerificationOptions,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn verified_config(
    root: &std::path::Path,
    mirror: &MockMirror,
    download: SignaturePolicy,
    disk_load: SignaturePolicy,
) -> RegistryConfig {
    let mut store = TrustStore::new();
    store
        .add_signer(TEST_SIGNER, &public_key_hex())
        .expect("add test signer");
    let options = VerificationOptions::new(Arc::new(store), download, disk_load)
        .expect("verification options");

    let mut cfg = RegistryConfig::new(root);
    cfg.mirrors = vec![mirror.url()];
    cfg.verification = BTreeMap::from([(String::new(), Some(options))]);
    cfg
}

fn plain_config(root: &std::path::Path, mirror: &MockMirror) -> RegistryConfig {
    let mut cfg = RegistryConfig::new(root);
    cfg.mirrors = vec![mirror.url()];
    cfg
}

fn stable_index_json(published: &str, releases: &[(&str, &str)]) -> Vec<u8> {
    let releases: Vec<String> = releases
        .iter()
        .map(|(id, v)| format!(r#""{id}": "{v}""#))
        .collect();
    format!(
        r#"{{"Channel": "stable", "Published": "{published}", "Releases": {{{}}}}}"#,
        releases.join(", ")
    )
    .into_bytes()
}

fn publish_signed_index(mirror: &MockMirror, published: &str, releases: &[(&str, &str)]) {
    let body = stable_index_json(published, releases);
    mirror.put("stable.v2.json.sig", sign_index(&body, "stable.v2.json"));
    mirror.put("stable.v2.json", body);
}

fn publish_artifact(mirror: &MockMirror, identifier: &str, version: &str, bytes: &[u8]) {
    let wire = aegis_updates::versioned_path(identifier, version);
    mirror.put(&format!("{wire}.sig"), sign_resource(bytes, identifier, version));
    mirror.put(&wire, bytes.to_vec());
}

// ---------------------------------------------------------------------------
// Index refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_indexes_registers_resources_and_persists_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    publish_signed_index(&mirror, "2022-01-02T00:00:00Z", &[("core/app", "1.0.0")]);

    let mut cfg = verified_config(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );
    cfg.indexes.push(IndexSpec {
        path: "stable.json".to_owned(),
        auto_download: true,
        pre_release: false,
    });
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();

    registry.update_indexes().await.expect("refresh");

    let export = registry.export();
    assert_eq!(export.len(), 1);
    assert_eq!(export[0].identifier, "core/app");
    assert!(export[0].versions[0].current_release);
    assert!(!export[0].versions[0].available);

    // Signed index and its signature are persisted world-readable.
    assert!(dir.path().join("stable.v2.json").exists());
    assert!(dir.path().join("stable.v2.json.sig").exists());

    let report = registry.last_update_check().expect("update-check report");
    assert_eq!(report.resources, vec!["core/app v1.0.0"]);
    assert!(report.error.is_none());
    assert!(registry.last_success().is_some());
}

#[tokio::test]
async fn corrupted_index_is_retried_on_another_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    let body = stable_index_json("2022-01-02T00:00:00Z", &[("core/app", "1.0.0")]);
    // Signature over different bytes: first attempt sees a checksum
    // mismatch and the refresh falls back to another attempt.
    mirror.put("stable.v2.json", b"{}".to_vec());
    mirror.put("stable.v2.json.sig", sign_index(&body, "stable.v2.json"));

    let mut cfg = verified_config(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );
    cfg.indexes.push(IndexSpec {
        path: "stable.json".to_owned(),
        auto_download: true,
        pre_release: false,
    });
    cfg.retry.index = 1;
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();

    let err = registry.update_indexes().await;
    assert!(matches!(err, Err(UpdateError::IndexChecksumMismatch(_))));

    // Publish the real bytes; the next refresh succeeds.
    mirror.put("stable.v2.json", body);
    registry.update_indexes().await.expect("refresh after fix");
    assert_eq!(registry.export().len(), 1);
}

// ---------------------------------------------------------------------------
// On-demand download
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_file_downloads_verifies_and_serves() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    let artifact = b"core binary v1";
    publish_signed_index(&mirror, "2022-01-02T00:00:00Z", &[("core/app", "1.0.0")]);
    publish_artifact(&mirror, "core/app", "1.0.0", artifact);

    let mut cfg = verified_config(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Require,
    );
    cfg.indexes.push(IndexSpec {
        path: "stable.json".to_owned(),
        auto_download: true,
        pre_release: false,
    });
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();
    registry.update_indexes().await.expect("refresh");

    let file = registry.get_file("core/app").await.expect("get file");
    assert_eq!(file.identifier(), "core/app");
    assert_eq!(file.version(), "1.0.0");
    assert_eq!(std::fs::read(file.path()).unwrap(), artifact);
    assert_eq!(file.human_readable(), "core/app v1.0.0");

    let export = registry.export();
    let v = &export[0].versions[0];
    assert!(v.available && v.sig_available && v.current_release);

    // A second call serves from disk without another download.
    let hits_before = mirror.hits();
    let again = registry.get_file("core/app").await.expect("serve local");
    assert_eq!(again.path(), file.path());
    assert_eq!(mirror.hits(), hits_before);
}

#[tokio::test]
async fn get_file_retries_transient_failures() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    let artifact = b"flaky mirror payload";
    publish_artifact(&mirror, "core/app", "1.0.0", artifact);

    let mut cfg = verified_config(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );
    cfg.retry.get_file = 3;
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();
    registry
        .add_resource("core/app", "1.0.0", AddVersionOpts::default())
        .unwrap();

    mirror.fail_next(2);
    let file = registry.get_file("core/app").await.expect("retries succeed");
    assert_eq!(std::fs::read(file.path()).unwrap(), artifact);
}

#[tokio::test]
async fn offline_registry_refuses_remote_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;

    let mut cfg = plain_config(dir.path(), &mirror);
    cfg.online = false;
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();
    registry
        .add_resource("core/app", "1.0.0", AddVersionOpts::default())
        .unwrap();

    let err = registry.get_file("core/app").await;
    assert!(matches!(err, Err(UpdateError::NotAvailableLocally(_))));
    assert_eq!(mirror.hits(), 0);
}

#[tokio::test]
async fn get_version_pins_an_explicit_version() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    publish_artifact(&mirror, "core/app", "1.0.0", b"old");
    publish_artifact(&mirror, "core/app", "1.1.0", b"new");

    let registry = Registry::new(plain_config(dir.path(), &mirror)).unwrap();
    registry.initialize().unwrap();
    registry
        .add_resource("core/app", "1.0.0", AddVersionOpts::default())
        .unwrap();
    registry
        .add_resource("core/app", "1.1.0", AddVersionOpts::default())
        .unwrap();

    let pinned = registry.get_version("core/app", "1.0.0").await.expect("pin");
    assert_eq!(pinned.version(), "1.0.0");
    assert_eq!(std::fs::read(pinned.path()).unwrap(), b"old");

    let err = registry.get_version("core/app", "9.9.9").await;
    assert!(matches!(err, Err(UpdateError::VersionNotFound { .. })));
}

// ---------------------------------------------------------------------------
// Bulk downloads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn download_updates_fetches_mandatory_resources_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    publish_signed_index(
        &mirror,
        "2022-01-02T00:00:00Z",
        &[("core/app", "1.0.0"), ("core/filter", "2.1.0")],
    );
    publish_artifact(&mirror, "core/app", "1.0.0", b"app bytes");
    publish_artifact(&mirror, "core/filter", "2.1.0", b"filter bytes");

    let mut cfg = verified_config(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );
    cfg.indexes.push(IndexSpec {
        path: "stable.json".to_owned(),
        auto_download: true,
        pre_release: false,
    });
    cfg.mandatory = vec!["core/app".to_owned(), "core/filter".to_owned()];
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();
    registry.update_indexes().await.expect("refresh");

    registry.download_updates(false).await.expect("bulk download");

    let report = registry.last_download().expect("download report");
    assert_eq!(
        report.resources,
        vec!["core/app v1.0.0", "core/filter v2.1.0"]
    );
    assert!(report.error.is_none());
    assert!(dir.path().join("core/app_v1-0-0").exists());
    assert!(dir.path().join("core/filter_v2-1-0").exists());
}

#[tokio::test]
async fn download_updates_fetches_missing_signatures() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    let artifact = b"already on disk";
    publish_signed_index(&mirror, "2022-01-02T00:00:00Z", &[("core/app", "1.0.0")]);
    publish_artifact(&mirror, "core/app", "1.0.0", artifact);

    let mut cfg = verified_config(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );
    cfg.indexes.push(IndexSpec {
        path: "stable.json".to_owned(),
        auto_download: true,
        pre_release: false,
    });
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();

    // The artifact is on disk from a previous install, signature missing.
    let artifact_path = dir.path().join("core/app_v1-0-0");
    std::fs::create_dir_all(artifact_path.parent().unwrap()).unwrap();
    std::fs::write(&artifact_path, artifact).unwrap();
    registry.scan_storage(None).expect("scan");

    registry.update_indexes().await.expect("refresh");
    registry.download_updates(false).await.expect("bulk download");

    assert!(dir.path().join("core/app_v1-0-0.sig").exists());
    let export = registry.export();
    assert!(export[0].versions[0].sig_available);
}

#[tokio::test]
async fn partial_bulk_failure_is_reported_but_does_not_abort() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    publish_signed_index(
        &mirror,
        "2022-01-02T00:00:00Z",
        &[("core/app", "1.0.0"), ("core/missing", "1.0.0")],
    );
    publish_artifact(&mirror, "core/app", "1.0.0", b"present");
    // core/missing has no artifact on the mirror.

    let mut cfg = verified_config(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );
    cfg.indexes.push(IndexSpec {
        path: "stable.json".to_owned(),
        auto_download: true,
        pre_release: false,
    });
    cfg.mandatory = vec!["core/app".to_owned(), "core/missing".to_owned()];
    cfg.retry.bulk = 1;
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();
    registry.update_indexes().await.expect("refresh");

    registry.download_updates(false).await.expect("batch completes");

    let report = registry.last_download().expect("download report");
    assert_eq!(report.resources, vec!["core/app v1.0.0"]);
    assert!(report.error.is_some());
    assert!(dir.path().join("core/app_v1-0-0").exists());
}

// ---------------------------------------------------------------------------
// Auto-unpack
// ---------------------------------------------------------------------------

#[tokio::test]
async fn downloaded_archives_are_auto_unpacked() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;

    let mut zip_bytes = Vec::new();
    {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
        writer
            .start_file("index.html", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"<html>panel</html>").unwrap();
        writer.finish().unwrap();
    }
    publish_artifact(&mirror, "ui/panel.zip", "1.0.0", &zip_bytes);

    let mut cfg = verified_config(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );
    cfg.auto_unpack = vec!["ui/panel.zip".to_owned()];
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();
    registry
        .add_resource("ui/panel.zip", "1.0.0", AddVersionOpts::default())
        .unwrap();

    registry.get_file("ui/panel.zip").await.expect("get file");

    let unpacked = dir.path().join("ui/panel_v1-0-0/index.html");
    assert_eq!(std::fs::read(&unpacked).unwrap(), b"<html>panel</html>");

    // Explicit request short-circuits on the existing directory.
    let unpacked_dir = registry.ensure_unpacked("ui/panel.zip").expect("unpack");
    assert_eq!(unpacked_dir, dir.path().join("ui/panel_v1-0-0"));
}

// ---------------------------------------------------------------------------
// Upgrade notifier
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handle_sees_upgrade_after_index_moves_on() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    publish_signed_index(&mirror, "2022-01-02T00:00:00Z", &[("core/app", "1.0.0")]);
    publish_artifact(&mirror, "core/app", "1.0.0", b"v1");

    let mut cfg = verified_config(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );
    cfg.indexes.push(IndexSpec {
        path: "stable.json".to_owned(),
        auto_download: true,
        pre_release: false,
    });
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();
    registry.update_indexes().await.expect("refresh");

    let mut handle = registry.get_file("core/app").await.expect("get file");
    assert!(!handle.upgrade_available());

    publish_signed_index(&mirror, "2022-02-01T00:00:00Z", &[("core/app", "1.1.0")]);
    registry.update_indexes().await.expect("second refresh");

    assert!(handle.upgrade_available());
    handle.wait_for_upgrade().await;
}
