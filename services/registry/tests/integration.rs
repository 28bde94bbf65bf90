//! Integration tests for the registry mirror

use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use camino::Utf8PathBuf;
use ed25519_dalek::SigningKey;
use registry_mirror::catalog::Catalog;
use registry_mirror::digest::{Algorithm, AllowedAlgorithms};
use registry_mirror::manifest::{DOCKER_MANIFEST, OCI_INDEX};
use registry_mirror::pull_through::PullThroughRule;
use registry_mirror::sync::{SyncOptions, SyncState, Syncer};
use registry_mirror::token::{Access, TokenIssuer, TokenValidator};
use registry_mirror::upstream::mock::MockUpstream;
use registry_mirror::{AuthGate, Digest, RegistryBuilder};
use storage::{LocalDriver, MemoryStorage};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn memory_catalog() -> Catalog {
    let storage: storage::Storage = MemoryStorage::with_buckets(&["test-registry"]).into();
    Catalog::new(storage.bucket("test-registry"), AllowedAlgorithms::default())
}

fn digest_of(data: &str) -> Digest {
    Algorithm::Sha256.digest(data.as_bytes())
}

/// Sync `library/app` from a mock holding a two-platform index tagged `latest`.
async fn synced(catalog: &Catalog) -> (MockUpstream, Digest) {
    let mock = MockUpstream::new();
    let amd64 = mock.add_image("library/app", None, "cfg-amd64", &["base", "amd64-app"]);
    let arm64 = mock.add_image("library/app", None, "cfg-arm64", &["base", "arm64-app"]);
    let index = mock.add_index(
        "library/app",
        Some("latest"),
        &[("amd64", &amd64), ("arm64", &arm64)],
    );
    mock.set_tags("library/app", &["latest"]);

    let run = Syncer::new(catalog.clone(), mock.upstream("hub"))
        .run(&SyncOptions::new("app", "library/app"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.state, SyncState::Completed);
    (mock, index)
}

async fn send(app: &axum::Router, method: Method, uri: &str, headers: &[(&str, &str)]) -> Response {
    let mut request = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    app.clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body(response: Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body(response).await).unwrap()
}

#[tokio::test]
async fn test_api_version_check() {
    let app = RegistryBuilder::new().catalog(memory_catalog()).build().unwrap();

    let response = send(&app, Method::GET, "/v2/", &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_manifest_get_and_head() {
    let catalog = memory_catalog();
    let (_mock, index) = synced(&catalog).await;
    let app = RegistryBuilder::new().catalog(catalog).build().unwrap();

    let response = send(
        &app,
        Method::GET,
        "/v2/app/manifests/latest",
        &[("accept", OCI_INDEX)],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], OCI_INDEX);
    assert_eq!(
        response.headers()["docker-content-digest"],
        index.to_string().as_str()
    );
    let length: usize = response.headers()[header::CONTENT_LENGTH]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let bytes = body(response).await;
    assert_eq!(bytes.len(), length);
    assert_eq!(Algorithm::Sha256.digest(&bytes), index);

    // By digest, without an Accept header.
    let response = send(&app, Method::GET, &format!("/v2/app/manifests/{index}"), &[]).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, Method::HEAD, "/v2/app/manifests/latest", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        length.to_string().as_str()
    );
    assert!(body(response).await.is_empty());
}

#[tokio::test]
async fn test_manifest_negotiation() {
    let catalog = memory_catalog();
    synced(&catalog).await;
    let app = RegistryBuilder::new().catalog(catalog).build().unwrap();

    let response = send(
        &app,
        Method::GET,
        "/v2/app/manifests/latest",
        &[("accept", DOCKER_MANIFEST)],
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["errors"][0]["code"], "MANIFEST_UNKNOWN");

    let response = send(&app, Method::GET, "/v2/app/manifests/missing", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_blob_download_and_ranges() {
    let catalog = memory_catalog();
    synced(&catalog).await;
    let app = RegistryBuilder::new().catalog(catalog).build().unwrap();
    let layer = digest_of("amd64-app");

    let response = send(&app, Method::GET, &format!("/v2/app/blobs/{layer}"), &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-content-digest"],
        layer.to_string().as_str()
    );
    assert_eq!(&body(response).await[..], b"amd64-app");

    let response = send(&app, Method::HEAD, &format!("/v2/app/blobs/{layer}"), &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "9");

    let response = send(
        &app,
        Method::GET,
        &format!("/v2/app/blobs/{layer}"),
        &[("range", "bytes=0-4")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-4/9");
    assert_eq!(&body(response).await[..], b"amd64");

    let response = send(
        &app,
        Method::GET,
        &format!("/v2/app/blobs/{layer}"),
        &[("range", "bytes=100-")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */9");

    let absent = digest_of("absent");
    let response = send(&app, Method::GET, &format!("/v2/app/blobs/{absent}"), &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["errors"][0]["code"], "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_tags_pagination() {
    let catalog = memory_catalog();
    let mock = MockUpstream::new();
    for tag in ["c", "a", "b"] {
        mock.add_image("library/app", Some(tag), &format!("cfg-{tag}"), &[tag]);
    }
    mock.set_tags("library/app", &["c", "a", "b"]);
    Syncer::new(catalog.clone(), mock.upstream("hub"))
        .run(&SyncOptions::new("app", "library/app"), CancellationToken::new())
        .await
        .unwrap();
    let app = RegistryBuilder::new().catalog(catalog).build().unwrap();

    let response = send(&app, Method::GET, "/v2/app/tags/list", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json(response).await,
        serde_json::json!({"name": "app", "tags": ["a", "b", "c"]})
    );

    let response = send(&app, Method::GET, "/v2/app/tags/list?n=2", &[]).await;
    let link = response.headers()[header::LINK].to_str().unwrap().to_owned();
    assert!(link.contains("last=b"), "{link}");
    assert_eq!(json(response).await["tags"], serde_json::json!(["a", "b"]));

    let response = send(&app, Method::GET, "/v2/app/tags/list?n=2&last=b", &[]).await;
    assert!(response.headers().get(header::LINK).is_none());
    assert_eq!(json(response).await["tags"], serde_json::json!(["c"]));

    let response = send(&app, Method::GET, "/v2/nope/tags/list", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["errors"][0]["code"], "NAME_UNKNOWN");

    let response = send(&app, Method::GET, "/v2/Not_Valid/tags/list", &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["errors"][0]["code"], "NAME_INVALID");
}

#[tokio::test]
async fn test_bearer_tokens() {
    let catalog = memory_catalog();
    synced(&catalog).await;

    let issuer = TokenIssuer::new(SigningKey::from_bytes(&[7; 32]), "auth.test", "registry.test");
    let validator = TokenValidator::new(issuer.verifying_key(), "auth.test", "registry.test");
    let app = RegistryBuilder::new()
        .catalog(catalog)
        .auth(AuthGate::new(validator, "https://auth.test/token", "registry.test"))
        .build()
        .unwrap();

    let response = send(&app, Method::GET, "/v2/app/manifests/latest", &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
    assert!(challenge.starts_with(r#"Bearer realm="https://auth.test/token""#));
    assert!(challenge.contains(r#"service="registry.test""#));
    assert!(challenge.contains(r#"scope="repository:app:pull""#));

    let response = send(
        &app,
        Method::GET,
        "/v2/app/manifests/latest",
        &[("authorization", "Bearer not.a.token")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
    assert!(challenge.contains(r#"error="invalid_token""#));

    let other = issuer.issue("alice", vec![Access::pull("other")]).unwrap();
    let response = send(
        &app,
        Method::GET,
        "/v2/app/manifests/latest",
        &[("authorization", &format!("Bearer {other}"))],
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json(response).await["errors"][0]["code"], "DENIED");

    let token = issuer.issue("alice", vec![Access::pull("app")]).unwrap();
    let bearer = format!("Bearer {token}");
    let response = send(
        &app,
        Method::GET,
        "/v2/app/manifests/latest",
        &[("authorization", &bearer)],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, Method::GET, "/v2/", &[("authorization", &bearer)]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_bearer_scope_uses_decoded_path() {
    let catalog = memory_catalog();
    synced(&catalog).await;

    let issuer = TokenIssuer::new(SigningKey::from_bytes(&[7; 32]), "auth.test", "registry.test");
    let validator = TokenValidator::new(issuer.verifying_key(), "auth.test", "registry.test");
    let app = RegistryBuilder::new()
        .catalog(catalog)
        .auth(AuthGate::new(validator, "https://auth.test/token", "registry.test"))
        .build()
        .unwrap();

    // `%61pp` is served as `app`, so only a grant for `app` may read it.
    let literal = issuer.issue("mallory", vec![Access::pull("%61pp")]).unwrap();
    let response = send(
        &app,
        Method::GET,
        "/v2/%61pp/manifests/latest",
        &[("authorization", &format!("Bearer {literal}"))],
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(&app, Method::GET, "/v2/%61pp/manifests/latest", &[]).await;
    let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
    assert!(challenge.contains(r#"scope="repository:app:pull""#));

    let token = issuer.issue("alice", vec![Access::pull("app")]).unwrap();
    let response = send(
        &app,
        Method::GET,
        "/v2/%61pp/manifests/latest",
        &[("authorization", &format!("Bearer {token}"))],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_pull_through() {
    let mock = MockUpstream::new();
    let digest = mock.add_image("library/alpine", Some("3.19"), "cfg", &["layer"]);
    let registry = RegistryBuilder::new()
        .catalog(memory_catalog())
        .pull_through(PullThroughRule::prefix("hub", mock.upstream("hub")))
        .registry()
        .unwrap();
    let app = registry.router();

    let response = send(&app, Method::GET, "/v2/hub/library/alpine/manifests/3.19", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-content-digest"],
        digest.to_string().as_str()
    );

    let layer = digest_of("layer");
    let response = send(
        &app,
        Method::GET,
        &format!("/v2/hub/library/alpine/blobs/{layer}"),
        &[],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body(response).await[..], b"layer");
    assert!(registry.catalog().content().exists(&layer).await.unwrap());

    let response = send(&app, Method::GET, "/v2/hub/library/alpine/tags/list", &[]).await;
    assert_eq!(json(response).await["tags"], serde_json::json!(["3.19"]));

    // A miss upstream leaves nothing behind.
    let response = send(&app, Method::GET, "/v2/hub/library/missing/manifests/latest", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(
        registry
            .catalog()
            .repository("hub/library/missing")
            .await
            .unwrap()
            .is_none()
    );

    let response = send(&app, Method::GET, "/v2/hub/library/missing/tags/list", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["tags"], serde_json::json!([]));
}

#[tokio::test]
async fn test_concurrent_pull_through_fetches_once() {
    let mock = MockUpstream::new();
    let digest = mock.add_image("library/app", None, "cfg", &["layer"]);
    mock.set_delay(Duration::from_millis(50));
    let app = RegistryBuilder::new()
        .catalog(memory_catalog())
        .pull_through(PullThroughRule::prefix("hub", mock.upstream("hub")))
        .build()
        .unwrap();

    let uri = format!("/v2/hub/library/app/manifests/{digest}");
    let responses =
        futures::future::join_all((0..8).map(|_| send(&app, Method::GET, &uri, &[]))).await;
    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(
        mock.hits(Method::GET, &format!("/v2/library/app/manifests/{digest}")),
        1
    );
}

#[tokio::test]
async fn test_corrupt_upstream_blob_is_not_served() {
    let mock = MockUpstream::new();
    let claimed = digest_of("real");
    mock.add_blob_at("library/app", &claimed, "fake");
    let registry = RegistryBuilder::new()
        .catalog(memory_catalog())
        .pull_through(PullThroughRule::prefix("hub", mock.upstream("hub")))
        .registry()
        .unwrap();
    let app = registry.router();

    let response = send(
        &app,
        Method::GET,
        &format!("/v2/hub/library/app/blobs/{claimed}"),
        &[],
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!registry.catalog().content().exists(&claimed).await.unwrap());
}

#[tokio::test]
async fn test_local_storage() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let storage: storage::Storage = LocalDriver::new(root).into();
    let catalog = Catalog::new(storage.bucket("registry"), AllowedAlgorithms::default());
    let (_mock, index) = synced(&catalog).await;

    let app = RegistryBuilder::new()
        .storage(storage)
        .bucket("registry")
        .build()
        .unwrap();

    let response = send(&app, Method::GET, "/v2/app/manifests/latest", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-content-digest"],
        index.to_string().as_str()
    );

    let base = digest_of("base");
    let response = send(&app, Method::GET, &format!("/v2/app/blobs/{base}"), &[]).await;
    assert_eq!(&body(response).await[..], b"base");
}
