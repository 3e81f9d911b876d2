/// Signature policy semantics on the download path: require blocks, warn
/// logs and serves, disable stores the signature without judging it.
use std::collections::BTreeMap;
use std::sync::Arc;

use aegis_test_utils::{MockMirror, TEST_SIGNER, public_key_hex, sign_resource};
use aegis_updates::{
    AddVersionOpts, Registry, RegistryConfig, SignaturePolicy, TrustStore, UpdateError,
    VerificationOptions,
};

fn registry_with_policy(
    root: &std::path::Path,
    mirror: &MockMirror,
    download: SignaturePolicy,
    disk_load: SignaturePolicy,
) -> Registry {
    let mut store = TrustStore::new();
    store
        .add_signer(TEST_SIGNER, &public_key_hex())
        .expect("add test signer");
    let options =
        VerificationOptions::new(Arc::new(store), download, disk_load).expect("options");

    let mut cfg = RegistryConfig::new(root);
    cfg.mirrors = vec![mirror.url()];
    cfg.verification = BTreeMap::from([(String::new(), Some(options))]);
    cfg.retry.get_file = 2;
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();
    registry
        .add_resource("core/app", "1.0.0", AddVersionOpts::default())
        .unwrap();
    registry
}

/// Publish an artifact whose bytes do not match the signed hash.
fn publish_tampered(mirror: &MockMirror) {
    mirror.put("core/app_v1-0-0", b"tampered bytes".to_vec());
    mirror.put(
        "core/app_v1-0-0.sig",
        sign_resource(b"genuine bytes", "core/app", "1.0.0"),
    );
}

#[tokio::test]
async fn require_policy_rejects_a_tampered_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    publish_tampered(&mirror);

    let registry = registry_with_policy(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );

    let err = registry.get_file("core/app").await;
    assert!(matches!(err, Err(UpdateError::Signature { .. })));

    // Nothing was stored and the version stays unavailable.
    assert!(!dir.path().join("core/app_v1-0-0").exists());
    let export = registry.export();
    assert!(!export[0].versions[0].available);
}

#[tokio::test]
async fn warn_policy_serves_the_artifact_anyway() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    publish_tampered(&mirror);

    let registry = registry_with_policy(
        dir.path(),
        &mirror,
        SignaturePolicy::Warn,
        SignaturePolicy::Warn,
    );

    let file = registry.get_file("core/app").await.expect("warn serves");
    assert_eq!(std::fs::read(file.path()).unwrap(), b"tampered bytes");
    let export = registry.export();
    assert!(export[0].versions[0].available);
}

#[tokio::test]
async fn disable_policy_still_stores_the_signature() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    publish_tampered(&mirror);

    let registry = registry_with_policy(
        dir.path(),
        &mirror,
        SignaturePolicy::Disable,
        SignaturePolicy::Disable,
    );

    registry.get_file("core/app").await.expect("disable serves");
    assert!(dir.path().join("core/app_v1-0-0").exists());
    assert!(dir.path().join("core/app_v1-0-0.sig").exists());
}

#[tokio::test]
async fn missing_signature_fails_require_but_passes_warn() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    // Artifact without any companion signature on the mirror.
    mirror.put("core/app_v1-0-0", b"unsigned bytes".to_vec());

    let registry = registry_with_policy(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    );
    let err = registry.get_file("core/app").await;
    assert!(err.is_err());

    let dir2 = tempfile::tempdir().unwrap();
    let registry = registry_with_policy(
        dir2.path(),
        &mirror,
        SignaturePolicy::Warn,
        SignaturePolicy::Warn,
    );
    let file = registry.get_file("core/app").await.expect("warn tolerates");
    assert_eq!(std::fs::read(file.path()).unwrap(), b"unsigned bytes");
}

#[tokio::test]
async fn uncovered_identifier_reports_verification_not_configured() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;

    let mut store = TrustStore::new();
    store
        .add_signer(TEST_SIGNER, &public_key_hex())
        .expect("add test signer");
    let options = VerificationOptions::new(
        Arc::new(store),
        SignaturePolicy::Require,
        SignaturePolicy::Warn,
    )
    .expect("options");

    let mut cfg = RegistryConfig::new(dir.path());
    cfg.mirrors = vec![mirror.url()];
    cfg.verification = BTreeMap::from([("core/".to_owned(), Some(options))]);
    let registry = Registry::new(cfg).unwrap();
    registry.initialize().unwrap();

    let err = registry.verify_resource("ui/panel");
    assert!(matches!(err, Err(UpdateError::VerificationNotConfigured(_))));
}

#[tokio::test]
async fn disk_load_policy_checks_existing_files() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = MockMirror::start().await;
    let artifact = b"genuine bytes";
    mirror.put("core/app_v1-0-0", artifact.to_vec());
    mirror.put(
        "core/app_v1-0-0.sig",
        sign_resource(artifact, "core/app", "1.0.0"),
    );

    let registry = registry_with_policy(
        dir.path(),
        &mirror,
        SignaturePolicy::Require,
        SignaturePolicy::Require,
    );
    registry.get_file("core/app").await.expect("download");

    // Corrupt the stored artifact; the next disk load refuses to serve it.
    std::fs::write(dir.path().join("core/app_v1-0-0"), b"bit rot").unwrap();
    let err = registry.get_file("core/app").await;
    assert!(matches!(err, Err(UpdateError::Signature { .. })));
}
