use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use opentelemetry::metrics::MeterProvider;

use refdepot::api::routes::AppMetrics;
use refdepot::config::{AppConfig, StorageBackend, StorageConfig};
use refdepot::digest::OciDigest;
use refdepot::manifest::{INDEX_SCHEMA_VERSION, MEDIA_TYPE_ARTIFACT_MANIFEST, MEDIA_TYPE_IMAGE_INDEX};
use refdepot::storage::Storage;

const REPO: &str = "testrepo";

// Helper function to start the registry server for testing
async fn start_test_server() -> (JoinHandle<()>, u16, Arc<Storage>, tempfile::TempDir) {
    // Use a random available port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let port = addr.port();

    let data_dir = tempfile::tempdir().unwrap();

    // Create a test configuration
    let config = AppConfig {
        port,
        storage: StorageConfig {
            backend: StorageBackend::Fs,
            fs_root: Some(data_dir.path().to_path_buf()),
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
        },
    };

    // Initialize storage
    let storage = Storage::new(&config).await.unwrap();
    let storage = Arc::new(storage);

    // Create metrics for testing
    let meter = opentelemetry::metrics::noop::NoopMeterProvider::new().meter("test");
    let app_metrics = Arc::new(AppMetrics {
        request_counter: meter.u64_counter("test_requests").init(),
        manifest_size_histogram: meter.f64_histogram("test_manifest_size").init(),
    });

    // Create application state
    let app_state = (Arc::clone(&storage), Arc::clone(&app_metrics));

    // Build application
    let app = axum::Router::new()
        .merge(refdepot::api::routes::registry_router(app_state))
        .with_state((Arc::clone(&storage), app_metrics));

    // Start server in a separate task
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    sleep(Duration::from_millis(100)).await;

    (server, port, storage, data_dir)
}

// Store bytes as an existing manifest revision of the test repository
async fn seed_manifest(storage: &Storage, content: &[u8]) -> OciDigest {
    let descriptor = storage
        .put_content(
            "application/vnd.oci.image.manifest.v1+json",
            bytes::Bytes::copy_from_slice(content),
        )
        .await
        .unwrap();
    storage.link_revision(REPO, &descriptor.digest).await.unwrap();
    descriptor.digest
}

fn artifact_manifest(artifact_type: &str, subject: &OciDigest) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "mediaType": MEDIA_TYPE_ARTIFACT_MANIFEST,
        "artifactType": artifact_type,
        "blobs": [],
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": subject.to_string(),
            "size": 2,
        }],
    }))
    .unwrap()
}

#[tokio::test]
async fn test_artifact_push_and_referrers_query() {
    let (server, port, storage, _dir) = start_test_server().await;
    let client = reqwest::Client::new();

    // A manifest the artifact will refer to
    let subject = seed_manifest(&storage, b"{\"subject\": true}").await;

    // Push a signature artifact naming the subject
    let body = artifact_manifest("sig", &subject);
    let response = client
        .put(format!("http://localhost:{}/v2/{}/manifests/sig-1", port, REPO))
        .header("Content-Type", MEDIA_TYPE_ARTIFACT_MANIFEST)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let pushed_digest = response
        .headers()
        .get("Docker-Content-Digest")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(pushed_digest, OciDigest::from_bytes(&body).to_string());

    // The subject's referrers now contain exactly the pushed artifact
    let referrers: serde_json::Value = client
        .get(format!(
            "http://localhost:{}/v2/{}/referrers/{}?artifact-type=sig",
            port, REPO, subject
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(referrers["digest"], subject.to_string());
    assert_eq!(referrers["nextLink"], "not implemented");
    let links = referrers["links"].as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["digest"], pushed_digest);
    assert_eq!(links[0]["mediaType"], MEDIA_TYPE_ARTIFACT_MANIFEST);

    // A filter for a different artifact type matches nothing
    let other: serde_json::Value = client
        .get(format!(
            "http://localhost:{}/v2/{}/referrers/{}?artifact-type=sbom",
            port, REPO, subject
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(other["links"].as_array().unwrap().len(), 0);

    server.abort();
}

#[tokio::test]
async fn test_push_with_missing_subject_fails_and_links_nothing() {
    let (server, port, _storage, _dir) = start_test_server().await;
    let client = reqwest::Client::new();

    let missing = OciDigest::from_bytes(b"never pushed");
    let body = artifact_manifest("sig", &missing);

    let response = client
        .put(format!("http://localhost:{}/v2/{}/manifests/sig-1", port, REPO))
        .header("Content-Type", MEDIA_TYPE_ARTIFACT_MANIFEST)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(error["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");
    // The aggregate names the missing reference
    let detail = error["errors"][0]["detail"].to_string();
    assert!(detail.contains(&missing.to_string()));

    // Nothing was stored or linked
    let referrers: serde_json::Value = client
        .get(format!(
            "http://localhost:{}/v2/{}/referrers/{}",
            port, REPO, missing
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(referrers["links"].as_array().unwrap().len(), 0);

    server.abort();
}

#[tokio::test]
async fn test_referrers_unknown_tag_is_structured_error() {
    let (server, port, _storage, _dir) = start_test_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "http://localhost:{}/v2/{}/referrers/no-such-tag",
            port, REPO
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(error["errors"][0]["code"], "MANIFEST_UNKNOWN");

    server.abort();
}

#[tokio::test]
async fn test_index_push_links_platform_entries_and_metadata() {
    let (server, port, storage, _dir) = start_test_server().await;
    let client = reqwest::Client::new();

    let amd64 = seed_manifest(&storage, b"{\"platform\": \"amd64\"}").await;
    let arm64 = seed_manifest(&storage, b"{\"platform\": \"arm64\"}").await;

    let config_media_type = "application/vnd.example.index.config+json";
    let config_content = bytes::Bytes::from_static(b"{\"cfg\": true}");
    let config_digest = OciDigest::from_bytes(&config_content);
    storage.put_blob(&config_digest, config_content.clone()).await.unwrap();

    let body = serde_json::to_vec(&serde_json::json!({
        "mediaType": MEDIA_TYPE_IMAGE_INDEX,
        "schemaVersion": INDEX_SCHEMA_VERSION,
        "config": {
            "mediaType": config_media_type,
            "digest": config_digest.to_string(),
            "size": config_content.len(),
        },
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": amd64.to_string(),
                "size": 21,
                "platform": {"architecture": "amd64", "os": "linux"},
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": arm64.to_string(),
                "size": 21,
                "platform": {"architecture": "arm64", "os": "linux"},
            },
        ],
    }))
    .unwrap();

    // Push the index under a tag
    let response = client
        .put(format!("http://localhost:{}/v2/{}/manifests/multi", port, REPO))
        .header("Content-Type", MEDIA_TYPE_IMAGE_INDEX)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let index_digest = OciDigest::from_bytes(&body).to_string();

    // Each platform entry now lists the index as a referrer
    for subject in [&amd64, &arm64] {
        let referrers: serde_json::Value = client
            .get(format!(
                "http://localhost:{}/v2/{}/referrers/{}",
                port, REPO, subject
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let links = referrers["links"].as_array().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0]["digest"], index_digest);

        // Metadata query keyed by the config media type finds it too
        let metadata: serde_json::Value = client
            .get(format!(
                "http://localhost:{}/v2/{}/referrer-metadata/{}",
                port, REPO, subject
            ))
            .query(&[("media-type", config_media_type)])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            metadata["referrerMetadata"].as_array().unwrap(),
            &vec![serde_json::json!(index_digest)]
        );
    }

    // The tag resolves through the metadata endpoint and echoes back
    let by_tag: serde_json::Value = client
        .get(format!(
            "http://localhost:{}/v2/{}/referrer-metadata/multi",
            port, REPO
        ))
        .query(&[("media-type", config_media_type)])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(by_tag["tag"], "multi");
    assert_eq!(by_tag["referrerMetadata"].as_array().unwrap().len(), 0);

    server.abort();
}

#[tokio::test]
async fn test_referrer_metadata_requires_media_type() {
    let (server, port, storage, _dir) = start_test_server().await;
    let client = reqwest::Client::new();

    let subject = seed_manifest(&storage, b"{}").await;

    let response = client
        .get(format!(
            "http://localhost:{}/v2/{}/referrer-metadata/{}",
            port, REPO, subject
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        error["errors"][0]["code"],
        "MANIFEST_METADATA_MEDIA_TYPE_UNSPECIFIED"
    );

    server.abort();
}

#[tokio::test]
async fn test_manifest_round_trips_exact_bytes() {
    let (server, port, storage, _dir) = start_test_server().await;
    let client = reqwest::Client::new();

    let subject = seed_manifest(&storage, b"{\"v\": 1}").await;

    // Unusual whitespace must survive storage and retrieval untouched
    let body = format!(
        "{{ \"artifactType\": \"sig\",\n  \"manifests\": [ {{\"mediaType\": \"application/vnd.oci.image.manifest.v1+json\", \"digest\": \"{}\", \"size\": 8}} ]  }}",
        subject
    );

    let response = client
        .put(format!("http://localhost:{}/v2/{}/manifests/sig-1", port, REPO))
        .header("Content-Type", MEDIA_TYPE_ARTIFACT_MANIFEST)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let digest = response
        .headers()
        .get("Docker-Content-Digest")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let fetched = client
        .get(format!(
            "http://localhost:{}/v2/{}/manifests/{}",
            port, REPO, digest
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(fetched.status(), 200);
    assert_eq!(
        fetched.headers().get("Docker-Content-Digest").unwrap().to_str().unwrap(),
        digest
    );
    let fetched_body = fetched.bytes().await.unwrap();
    assert_eq!(fetched_body.as_ref(), body.as_bytes());

    // The tag reference resolves to the same bytes
    let by_tag = client
        .get(format!("http://localhost:{}/v2/{}/manifests/sig-1", port, REPO))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(by_tag.as_ref(), body.as_bytes());

    server.abort();
}

#[tokio::test]
async fn test_push_rejects_mismatched_digest_reference() {
    let (server, port, storage, _dir) = start_test_server().await;
    let client = reqwest::Client::new();

    let subject = seed_manifest(&storage, b"{}").await;
    let body = artifact_manifest("sig", &subject);
    let wrong_digest = OciDigest::from_bytes(b"different content");

    let response = client
        .put(format!(
            "http://localhost:{}/v2/{}/manifests/{}",
            port, REPO, wrong_digest
        ))
        .header("Content-Type", MEDIA_TYPE_ARTIFACT_MANIFEST)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    server.abort();
}
