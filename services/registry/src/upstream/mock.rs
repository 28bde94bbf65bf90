//! A scripted, in-memory upstream registry.
//!
//! [`MockUpstream`] is a `tower::Service` standing in for the HTTP transport of an
//! [`Upstream`](super::Upstream). It serves registered manifests, blobs and tag lists, counts
//! hits per `METHOD path`, and can be told to fail, stall, redirect or demand a token.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode, Uri};
use hyperdriver::service::SharedService;
use parking_lot::Mutex;

use super::{Backoff, DOCKER_CONTENT_DIGEST, Upstream, UpstreamOptions};
use crate::digest::{Algorithm, Digest};
use crate::manifest::{Manifest, OCI_INDEX, OCI_MANIFEST};

const HOST: &str = "https://upstream.test";

#[derive(Debug, Clone)]
struct Scripted {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Scripted {
    fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Scripted {
            status,
            headers,
            body,
        }
    }

    fn error(status: StatusCode) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = format!(
            r#"{{"errors":[{{"code":"UNKNOWN","message":"{}"}}]}}"#,
            status.canonical_reason().unwrap_or("error")
        );
        Scripted::new(status, headers, Bytes::from(body))
    }

    fn into_response(self, method: &Method) -> http::Response<hyperdriver::Body> {
        let body = if method == Method::HEAD {
            hyperdriver::Body::empty()
        } else {
            hyperdriver::Body::from(self.body)
        };
        let mut response = http::Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Debug, Default)]
struct State {
    routes: HashMap<(Method, String), Scripted>,
    once: HashMap<(Method, String), VecDeque<Scripted>>,
    blobs: HashMap<String, Bytes>,
    truncate: HashMap<String, usize>,
    token: Option<String>,
    delay: Option<Duration>,
    hits: HashMap<String, usize>,
    authorized: HashMap<String, bool>,
    hosts: Vec<String>,
    ranges: usize,
    ignore_ranges: bool,
}

impl State {
    fn respond(&mut self, request: &http::Request<hyperdriver::Body>) -> Scripted {
        let method = request.method().clone();
        let path = request.uri().path().to_owned();
        let path_and_query = request
            .uri()
            .path_and_query()
            .map_or_else(|| path.clone(), |pq| pq.to_string());
        let key = format!("{method} {path}");
        let authorization = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        *self.hits.entry(key.clone()).or_default() += 1;
        self.authorized.insert(key, authorization.is_some());
        if let Some(host) = request.uri().host() {
            self.hosts.push(host.to_owned());
        }

        if path == "/token" {
            return match &self.token {
                Some(token) => Scripted::new(
                    StatusCode::OK,
                    HeaderMap::new(),
                    Bytes::from(format!(r#"{{"token": "{token}", "expires_in": 300}}"#)),
                ),
                None => Scripted::error(StatusCode::NOT_FOUND),
            };
        }

        if let Some(token) = &self.token {
            let expected = format!("Bearer {token}");
            if path.starts_with("/v2/") && authorization.as_deref() != Some(expected.as_str()) {
                return challenge(&path);
            }
        }

        for candidate in [&path_and_query, &path] {
            let route = (method.clone(), candidate.clone());
            if let Some(scripted) = self.once.get_mut(&route).and_then(VecDeque::pop_front) {
                return scripted;
            }
            if let Some(scripted) = self.routes.get(&route) {
                return scripted.clone();
            }
        }

        if let Some(data) = self.blobs.get(&path).cloned() {
            if method == Method::GET || method == Method::HEAD {
                return self.serve_blob(&path, request.headers(), data);
            }
        }

        Scripted::error(StatusCode::NOT_FOUND)
    }

    fn serve_blob(&mut self, path: &str, headers: &HeaderMap, data: Bytes) -> Scripted {
        let total = data.len();
        let range = headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|value| value.split_once('-'))
            .and_then(|(start, _)| start.parse::<usize>().ok())
            .filter(|_| !self.ignore_ranges);

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );

        if let Some(start) = range {
            if start >= total {
                return Scripted::error(StatusCode::RANGE_NOT_SATISFIABLE);
            }
            self.ranges += 1;
            let body = data.slice(start..);
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            if let Ok(value) =
                HeaderValue::try_from(format!("bytes {}-{}/{}", start, total - 1, total))
            {
                response_headers.insert(header::CONTENT_RANGE, value);
            }
            return Scripted::new(StatusCode::PARTIAL_CONTENT, response_headers, body);
        }

        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
        let body = match self.truncate.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                data.slice(..total / 2)
            }
            _ => data,
        };
        Scripted::new(StatusCode::OK, response_headers, body)
    }
}

fn challenge(path: &str) -> Scripted {
    let repository = path
        .strip_prefix("/v2/")
        .and_then(|rest| {
            ["/manifests/", "/blobs/", "/tags/list"]
                .iter()
                .find_map(|marker| rest.split_once(marker).map(|(name, _)| name))
        })
        .unwrap_or("");
    let mut scripted = Scripted::error(StatusCode::UNAUTHORIZED);
    let value = format!(
        r#"Bearer realm="{HOST}/token",service="upstream.test",scope="repository:{repository}:pull""#
    );
    if let Ok(value) = HeaderValue::try_from(value) {
        scripted.headers.insert(header::WWW_AUTHENTICATE, value);
    }
    scripted
}

/// A scripted upstream registry.
#[derive(Debug, Clone, Default)]
pub struct MockUpstream {
    state: Arc<Mutex<State>>,
}

impl MockUpstream {
    /// An upstream with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options suited to tests: quick backoff, three attempts.
    pub fn options(&self) -> UpstreamOptions {
        UpstreamOptions {
            timeout: Duration::from_secs(5),
            attempts: 3,
            concurrency: 8,
            backoff: Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(10)),
            max_redirects: 5,
        }
    }

    /// An [`Upstream`] client talking to this mock.
    pub fn upstream(&self, name: &str) -> Upstream {
        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .service(self.clone());
        Upstream::assemble(
            name.to_owned(),
            vec![Uri::from_static(HOST)],
            self.options(),
            service,
        )
    }

    /// Serve a fixed response for `method path`. A path with a query only matches that query.
    pub fn respond(
        &self,
        method: Method,
        path: &str,
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) {
        self.state.lock().routes.insert(
            (method, path.to_owned()),
            Scripted::new(status, headers, body.into()),
        );
    }

    /// Answer the next request for `method path` with a bare `status`.
    pub fn once(&self, method: Method, path: &str, status: StatusCode) {
        self.state
            .lock()
            .once
            .entry((method, path.to_owned()))
            .or_default()
            .push_back(Scripted::error(status));
    }

    /// Redirect `method path` to `location`.
    pub fn redirect(&self, method: Method, path: &str, location: &str) {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::try_from(location) {
            headers.insert(header::LOCATION, value);
        }
        self.respond(method, path, StatusCode::TEMPORARY_REDIRECT, headers, Bytes::new());
    }

    /// Register a manifest under its digest and, optionally, a tag. Returns the digest.
    pub fn add_manifest(
        &self,
        repository: &str,
        tag: Option<&str>,
        media_type: &str,
        body: impl Into<Bytes>,
    ) -> Digest {
        let body = body.into();
        let digest = Manifest::parse(Some(media_type), body.clone(), Algorithm::Sha256)
            .map(|manifest| manifest.digest)
            .unwrap_or_else(|_| Algorithm::Sha256.digest(&body));

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::try_from(media_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Ok(value) = HeaderValue::try_from(digest.to_string()) {
            headers.insert(DOCKER_CONTENT_DIGEST, value);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

        let scripted = Scripted::new(StatusCode::OK, headers, body);
        let mut state = self.state.lock();
        let references = std::iter::once(digest.to_string()).chain(tag.map(str::to_owned));
        for reference in references {
            let path = format!("/v2/{repository}/manifests/{reference}");
            for method in [Method::GET, Method::HEAD] {
                state
                    .routes
                    .insert((method, path.clone()), scripted.clone());
            }
        }
        digest
    }

    /// Register an OCI image built from config and layer contents, returning the manifest digest.
    pub fn add_image(
        &self,
        repository: &str,
        tag: Option<&str>,
        config: &str,
        layers: &[&str],
    ) -> Digest {
        let config_digest = self.add_blob(repository, config.to_owned());
        let layers: Vec<serde_json::Value> = layers
            .iter()
            .map(|data| {
                let digest = self.add_blob(repository, (*data).to_owned());
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": digest.to_string(),
                    "size": data.len(),
                })
            })
            .collect();
        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest.to_string(),
                "size": config.len(),
            },
            "layers": layers,
        });
        self.add_manifest(repository, tag, OCI_MANIFEST, body.to_string())
    }

    /// Register an OCI index over `(architecture, manifest)` pairs, returning its digest.
    pub fn add_index(
        &self,
        repository: &str,
        tag: Option<&str>,
        platforms: &[(&str, &Digest)],
    ) -> Digest {
        let manifests: Vec<serde_json::Value> = platforms
            .iter()
            .map(|(architecture, digest)| {
                serde_json::json!({
                    "mediaType": OCI_MANIFEST,
                    "digest": digest.to_string(),
                    "platform": {"architecture": architecture, "os": "linux"},
                })
            })
            .collect();
        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": manifests,
        });
        self.add_manifest(repository, tag, OCI_INDEX, body.to_string())
    }

    /// Stop serving a manifest reference.
    pub fn remove_manifest(&self, repository: &str, reference: &str) {
        let path = format!("/v2/{repository}/manifests/{reference}");
        let mut state = self.state.lock();
        for method in [Method::GET, Method::HEAD] {
            state.routes.remove(&(method, path.clone()));
        }
    }

    /// Register a blob, returning its sha256 digest.
    pub fn add_blob(&self, repository: &str, data: impl Into<Bytes>) -> Digest {
        let data = data.into();
        let digest = Algorithm::Sha256.digest(&data);
        self.add_blob_at(repository, &digest, data);
        digest
    }

    /// Serve `data` under `digest`, whether or not it matches.
    pub fn add_blob_at(&self, repository: &str, digest: &Digest, data: impl Into<Bytes>) {
        self.state
            .lock()
            .blobs
            .insert(format!("/v2/{repository}/blobs/{digest}"), data.into());
    }

    /// Cut the next full download of a blob off halfway.
    pub fn truncate_once(&self, repository: &str, digest: &Digest) {
        *self
            .state
            .lock()
            .truncate
            .entry(format!("/v2/{repository}/blobs/{digest}"))
            .or_default() += 1;
    }

    /// Serve whole blobs even when asked for a range.
    pub fn ignore_ranges(&self) {
        self.state.lock().ignore_ranges = true;
    }

    /// Set the tag list of a repository.
    pub fn set_tags(&self, repository: &str, tags: &[&str]) {
        let body = serde_json::json!({"name": repository, "tags": tags}).to_string();
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.respond(
            Method::GET,
            &format!("/v2/{repository}/tags/list"),
            StatusCode::OK,
            headers,
            body,
        );
    }

    /// Require `Authorization: Bearer <token>` on every `/v2/` request, issued from `/token`.
    pub fn require_token(&self, token: &str) {
        self.state.lock().token = Some(token.to_owned());
    }

    /// Delay every response.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    /// Requests seen for `method path`.
    pub fn hits(&self, method: Method, path: &str) -> usize {
        self.state
            .lock()
            .hits
            .get(&format!("{method} {path}"))
            .copied()
            .unwrap_or(0)
    }

    /// Requests seen for any path under `prefix`.
    pub fn hits_under(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .hits
            .iter()
            .filter(|(key, _)| {
                key.split_once(' ')
                    .is_some_and(|(_, path)| path.starts_with(prefix))
            })
            .map(|(_, count)| count)
            .sum()
    }

    /// Whether the last request for `method path` carried an `Authorization` header.
    pub fn authorized(&self, method: Method, path: &str) -> bool {
        self.state
            .lock()
            .authorized
            .get(&format!("{method} {path}"))
            .copied()
            .unwrap_or(false)
    }

    /// The host of every request, in order.
    pub fn hosts(&self) -> Vec<String> {
        self.state.lock().hosts.clone()
    }

    /// Range requests served.
    pub fn ranges_served(&self) -> usize {
        self.state.lock().ranges
    }
}

impl tower::Service<http::Request<hyperdriver::Body>> for MockUpstream {
    type Response = http::Response<hyperdriver::Body>;
    type Error = hyperdriver::client::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<hyperdriver::Body>) -> Self::Future {
        let (scripted, delay) = {
            let mut state = self.state.lock();
            (state.respond(&request), state.delay)
        };
        let method = request.method().clone();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(scripted.into_response(&method))
        })
    }
}
