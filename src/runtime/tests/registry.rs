//! Local cache registry served over real sockets.

use std::path::Path;
use std::sync::Arc;

use a3s_mirror_core::{LogLevel, MultiArch};
use a3s_mirror_runtime::registry::storage::sha256_digest;
use a3s_mirror_runtime::{
    CopyOptions, FaultHandler, LocalRegistry, Mirror, OciMirror, RegistryAuth, RegistryConfig,
    RegistryHandle, RegistryLog, RegistryState,
};
use tempfile::TempDir;

const CONFIG_BLOB: &[u8] = br#"{"architecture":"amd64","os":"linux"}"#;
const LAYER_BLOB: &[u8] = b"not really a tarball";

fn no_fault() -> FaultHandler {
    Arc::new(|details| panic!("unexpected registry fault: {details}"))
}

async fn start(root: &Path, log: RegistryLog, level: LogLevel) -> RegistryHandle {
    let config = RegistryConfig::generate(root, 0, level).unwrap();
    LocalRegistry::new(config, log)
        .unwrap()
        .start(no_fault())
        .await
        .unwrap()
}

fn manifest() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": sha256_digest(CONFIG_BLOB),
            "size": CONFIG_BLOB.len()
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": sha256_digest(LAYER_BLOB),
            "size": LAYER_BLOB.len()
        }]
    }))
    .unwrap()
}

/// Push a small image over plain HTTP.
async fn seed(base: &str, repository: &str, tag: &str) {
    let http = reqwest::Client::new();
    for blob in [CONFIG_BLOB, LAYER_BLOB] {
        let response = http
            .post(format!(
                "{}/v2/{}/blobs/uploads/?digest={}",
                base,
                repository,
                sha256_digest(blob)
            ))
            .body(blob.to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }
    let response = http
        .put(format!("{}/v2/{}/manifests/{}", base, repository, tag))
        .header("content-type", "application/vnd.oci.image.manifest.v1+json")
        .body(manifest())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
}

fn copy_options(port: u16) -> CopyOptions {
    CopyOptions {
        src_tls_verify: true,
        dest_tls_verify: true,
        multi_arch: MultiArch::All,
        local_storage_fqdn: format!("localhost:{}", port),
    }
}

#[tokio::test]
async fn test_serves_distribution_api() {
    let tmp = TempDir::new().unwrap();
    let mut handle = start(tmp.path(), RegistryLog::stderr(LogLevel::Error), LogLevel::Info).await;
    let base = format!("http://127.0.0.1:{}", handle.port());

    let response = reqwest::get(format!("{}/v2/", base)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );

    seed(&base, "org/image", "v1").await;

    let http = reqwest::Client::new();
    let head = http
        .head(format!("{}/v2/org/image/manifests/v1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(head.status(), 200);
    assert_eq!(
        head.headers().get("docker-content-digest").unwrap(),
        sha256_digest(&manifest()).as_str()
    );

    let missing = http
        .head(format!("{}/v2/org/image/manifests/v2", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    assert!(tmp
        .path()
        .join("docker/registry/v2/repositories/org/image/_manifests/tags/v1/current/link")
        .exists());

    handle.stop().await.unwrap();
    assert_eq!(handle.state(), RegistryState::Stopped);
}

#[tokio::test]
async fn test_oci_mirror_check() {
    let tmp = TempDir::new().unwrap();
    let mut handle = start(tmp.path(), RegistryLog::stderr(LogLevel::Error), LogLevel::Info).await;
    let port = handle.port();
    seed(&format!("http://127.0.0.1:{}", port), "org/image", "v1").await;

    let mirror = OciMirror::new(RegistryAuth::anonymous()).unwrap();
    let opts = copy_options(port);
    assert!(mirror
        .check(&format!("docker://localhost:{}/org/image:v1", port), &opts)
        .await
        .unwrap());
    assert!(!mirror
        .check(&format!("docker://localhost:{}/org/image:v2", port), &opts)
        .await
        .unwrap());
    assert!(!mirror
        .check(&format!("docker://localhost:{}/org/other:v1", port), &opts)
        .await
        .unwrap());

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_oci_mirror_copies_between_registries() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let mut source = start(source_dir.path(), RegistryLog::stderr(LogLevel::Error), LogLevel::Info).await;
    let mut target = start(target_dir.path(), RegistryLog::stderr(LogLevel::Error), LogLevel::Info).await;
    seed(&format!("http://127.0.0.1:{}", source.port()), "org/image", "v1").await;

    let mirror = OciMirror::new(RegistryAuth::anonymous()).unwrap();
    let opts = copy_options(target.port());
    mirror
        .copy(
            &format!("docker://localhost:{}/org/image:v1", source.port()),
            &format!("docker://localhost:{}/mirror/org/image:v1", target.port()),
            &opts,
        )
        .await
        .unwrap();

    let manifest_digest = sha256_digest(&manifest());
    let response = reqwest::Client::new()
        .get(format!(
            "http://127.0.0.1:{}/v2/mirror/org/image/manifests/v1",
            target.port()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("docker-content-digest").unwrap(),
        manifest_digest.as_str()
    );
    let layer = reqwest::get(format!(
        "http://127.0.0.1:{}/v2/mirror/org/image/blobs/{}",
        target.port(),
        sha256_digest(LAYER_BLOB)
    ))
    .await
    .unwrap()
    .bytes()
    .await
    .unwrap();
    assert_eq!(&layer[..], LAYER_BLOB);

    source.stop().await.unwrap();
    target.stop().await.unwrap();
}

#[tokio::test]
async fn test_access_log_goes_to_registry_log_file() {
    let tmp = TempDir::new().unwrap();
    let cache = tmp.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    let log_path = tmp.path().join("registry.log");

    let mut handle = start(
        &cache,
        RegistryLog::create(&log_path, LogLevel::Debug),
        LogLevel::Debug,
    )
    .await;
    let response = reqwest::get(format!("http://127.0.0.1:{}/v2/", handle.port()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    handle.stop().await.unwrap();

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("Listening"));
    assert!(content.contains("path=/v2/"));
    assert!(content.contains("status=200"));
}
