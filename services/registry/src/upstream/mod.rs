//! The remote fetcher.
//!
//! [`Upstream`] speaks the registry distribution API to one upstream registry: tag listing and
//! resolution, manifest and blob fetches, bearer token negotiation, redirects, ranged resumes,
//! and retries rotated across the upstream and its mirrors. Every byte it hands back has been
//! checked against the digest it was asked for.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use echocache::{BoxFut, Cached};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::service::SharedService;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::sync::Semaphore;
use tower::ServiceExt as _;

use crate::content::ContentStore;
use crate::digest::{Algorithm, Digest};
use crate::error::{ErrorKind, Failure, RegistryError, RegistryResult};
use crate::manifest::{Manifest, MediaType};

mod auth;
pub mod mock;
mod retry;

use self::auth::{Token, TokenResponse};
pub use self::auth::{Challenge, Credentials, Login, Scheme, basic_auth};
pub use self::retry::Backoff;
use self::retry::Retry;

/// The HTTP transport used to reach upstream registries.
pub type UpstreamService = hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>;

/// Header carrying the canonical digest of a manifest or blob.
pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

const MAX_TAG_PAGES: usize = 1000;

/// Limits applied to every call against an upstream.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    /// Per-call timeout. Applies to the response head and to each body frame.
    pub timeout: Duration,

    /// Attempts per call, rotated across the upstream url and its mirrors.
    pub attempts: usize,

    /// Concurrent calls allowed against this upstream.
    pub concurrency: usize,

    /// Delay policy between attempts.
    pub backoff: Backoff,

    /// Redirect hops followed before giving up.
    pub max_redirects: usize,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        UpstreamOptions {
            timeout: Duration::from_secs(30),
            attempts: 3,
            concurrency: 8,
            backoff: Backoff::default(),
            max_redirects: 5,
        }
    }
}

/// A byte range for a blob fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,

    /// Last byte offset, inclusive. `None` reads to the end.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Everything from `start` onwards.
    pub fn from(start: u64) -> Self {
        ByteRange { start, end: None }
    }

    fn header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// An open blob download.
#[derive(Debug)]
pub struct BlobResponse {
    /// Whether the upstream honoured the requested range.
    pub partial: bool,

    /// Length of this response body, if declared.
    pub length: Option<u64>,

    /// Total size of the blob, if known.
    pub total: Option<u64>,

    /// The body.
    pub body: hyperdriver::Body,
}

struct Inner {
    name: String,
    endpoints: Vec<Uri>,
    service: UpstreamService,
    login: ArcSwapOption<Login>,
    tokens: DashMap<String, Cached<Result<Token, Failure>>>,
    options: UpstreamOptions,
    permits: Semaphore,
}

/// A client for one upstream registry.
#[derive(Clone)]
pub struct Upstream {
    inner: Arc<Inner>,
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("name", &self.inner.name)
            .field("endpoints", &self.inner.endpoints)
            .field("options", &self.inner.options)
            .finish()
    }
}

/// A single logical call: the same request sent to whichever endpoint is up next.
#[derive(Debug, Clone)]
struct Call {
    method: Method,
    path: String,
    scope: String,
    headers: HeaderMap,
    offset: usize,
}

impl Call {
    fn new(method: Method, path: String, repository: &str) -> Self {
        Call {
            method,
            path,
            scope: format!("repository:{repository}:pull"),
            headers: HeaderMap::new(),
            offset: 0,
        }
    }

    fn header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    fn accept_manifests(self) -> Self {
        match HeaderValue::try_from(MediaType::accept_header()) {
            Ok(value) => self.header(header::ACCEPT, value),
            Err(_) => self,
        }
    }

    fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

fn invalid_url(error: impl fmt::Display) -> RegistryError {
    RegistryError::UpstreamUnavailable(format!("invalid upstream url: {error}"))
}

/// Append `path` to the base url, keeping any path prefix the base carries.
fn join(base: &Uri, path: &str) -> RegistryResult<Uri> {
    let prefix = base.path().trim_end_matches('/');
    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(format!("{prefix}{path}").parse().map_err(invalid_url)?);
    Uri::from_parts(parts).map_err(invalid_url)
}

/// Resolve a `Location` header against the url that produced it.
fn resolve(current: &Uri, location: &str) -> RegistryResult<Uri> {
    let target: Uri = location.parse().map_err(invalid_url)?;
    if target.scheme().is_some() {
        return Ok(target);
    }

    let path = if location.starts_with('/') {
        location.to_owned()
    } else {
        let directory = current.path().rsplit_once('/').map_or("", |(dir, _)| dir);
        format!("{directory}/{location}")
    };
    let mut parts = current.clone().into_parts();
    parts.path_and_query = Some(path.parse().map_err(invalid_url)?);
    Uri::from_parts(parts).map_err(invalid_url)
}

/// The `rel="next"` target of a `Link` header, as a path and query.
fn next_link(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(header::LINK) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for link in value.split(',') {
            let Some((target, params)) = link.split_once(';') else {
                continue;
            };
            if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
                continue;
            }
            let target = target.trim().trim_start_matches('<').trim_end_matches('>');
            return match target.parse::<Uri>() {
                Ok(uri) if uri.scheme().is_some() => uri.path_and_query().map(|pq| pq.to_string()),
                _ => Some(target.to_owned()),
            };
        }
    }
    None
}

/// Parse the total size out of `Content-Range: bytes 0-99/1234`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .trim()
        .parse()
        .ok()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Map an unsuccessful upstream status to an error.
fn status_error(
    status: StatusCode,
    what: String,
    not_found: fn(String) -> RegistryError,
) -> RegistryError {
    match status {
        StatusCode::NOT_FOUND => not_found(what),
        StatusCode::UNAUTHORIZED => RegistryError::Unauthorized(format!("upstream refused {what}")),
        StatusCode::FORBIDDEN => RegistryError::Denied(format!("upstream denied {what}")),
        StatusCode::TOO_MANY_REQUESTS => RegistryError::RateLimited(what),
        StatusCode::RANGE_NOT_SATISFIABLE => RegistryError::RangeNotSatisfiable,
        status => RegistryError::UpstreamUnavailable(format!("upstream returned {status} for {what}")),
    }
}

/// Read a whole body.
pub(crate) async fn collect<B>(body: B) -> RegistryResult<Bytes>
where
    B: http_body::Body,
    B::Error: Into<tower::BoxError>,
{
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|error| RegistryError::UpstreamUnavailable(error.into().to_string()))
}

/// How a streamed body ended.
enum BodyEnd {
    Complete,
    BrokeOff(RegistryError),
}

/// Stream a body into `sink`, dropping its first `skip` bytes. Each frame must arrive within
/// `timeout`. Failures writing to `sink` are returned as errors.
async fn write_body<B, W>(
    body: B,
    sink: &mut W,
    mut skip: u64,
    written: &mut u64,
    timeout: Duration,
) -> std::io::Result<BodyEnd>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<tower::BoxError>,
    W: AsyncWrite + Unpin,
{
    let mut body = std::pin::pin!(body);
    loop {
        let frame = match tokio::time::timeout(timeout, body.frame()).await {
            Err(_) => {
                return Ok(BodyEnd::BrokeOff(RegistryError::UpstreamUnavailable(
                    "timed out reading body".into(),
                )));
            }
            Ok(None) => return Ok(BodyEnd::Complete),
            Ok(Some(Err(error))) => {
                return Ok(BodyEnd::BrokeOff(RegistryError::UpstreamUnavailable(
                    error.into().to_string(),
                )));
            }
            Ok(Some(Ok(frame))) => frame,
        };
        let Ok(mut chunk) = frame.into_data() else {
            continue;
        };

        if skip > 0 {
            let dropped = skip.min(chunk.len() as u64);
            chunk = chunk.slice(dropped as usize..);
            skip -= dropped;
        }
        sink.write_all(&chunk).await?;
        *written += chunk.len() as u64;
    }
}

fn sink_error(err: std::io::Error) -> RegistryError {
    RegistryError::Storage(storage::StorageError::from_io("stream", err))
}

impl Upstream {
    /// Connect to an upstream over HTTP(S).
    ///
    /// `endpoints` is the upstream url followed by any mirrors.
    pub fn connect(
        name: impl Into<String>,
        endpoints: Vec<Uri>,
        options: UpstreamOptions,
    ) -> RegistryResult<Self> {
        let service = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .build_service();
        Self::build(name.into(), endpoints, options, service)
    }

    /// Use a custom transport, such as [`mock::MockUpstream`].
    pub fn with_service<S>(
        name: impl Into<String>,
        endpoints: Vec<Uri>,
        options: UpstreamOptions,
        inner: S,
    ) -> RegistryResult<Self>
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .service(inner);
        Self::build(name.into(), endpoints, options, service)
    }

    fn build(
        name: String,
        endpoints: Vec<Uri>,
        options: UpstreamOptions,
        service: UpstreamService,
    ) -> RegistryResult<Self> {
        if endpoints.is_empty() {
            return Err(invalid_url(format!("{name} has no url")));
        }
        Ok(Self::assemble(name, endpoints, options, service))
    }

    /// `endpoints` must not be empty.
    fn assemble(
        name: String,
        endpoints: Vec<Uri>,
        options: UpstreamOptions,
        service: UpstreamService,
    ) -> Self {
        Upstream {
            inner: Arc::new(Inner {
                permits: Semaphore::new(options.concurrency.max(1)),
                name,
                endpoints,
                service,
                login: ArcSwapOption::empty(),
                tokens: DashMap::new(),
                options,
            }),
        }
    }

    /// Replace the credentials used for token requests and basic challenges.
    pub fn set_login(&self, login: Option<Login>) {
        self.inner.login.store(login.map(Arc::new));
        self.inner.tokens.clear();
    }

    /// The configured name of this upstream.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The upstream url followed by its mirrors.
    pub fn endpoints(&self) -> &[Uri] {
        &self.inner.endpoints
    }

    fn endpoint(&self, index: usize) -> &Uri {
        &self.inner.endpoints[index % self.inner.endpoints.len()]
    }

    fn cached_token(&self, scope: &str) -> Option<HeaderValue> {
        let cache = self.inner.tokens.get(scope)?;
        cache
            .map_cached(|token| {
                token
                    .as_ref()
                    .ok()
                    .filter(|token| token.is_fresh())
                    .map(|token| token.header.clone())
            })
            .flatten()
    }

    /// Send a call, retrying retryable failures across endpoints.
    async fn send(&self, call: &Call) -> RegistryResult<http::Response<hyperdriver::Body>> {
        let options = &self.inner.options;
        let attempts = options.attempts.max(1);
        let mut backoff = options.backoff.clone();
        let mut last_error = None;

        for attempt in 0..attempts {
            let endpoint = self.endpoint(call.offset + attempt);
            let outcome = {
                let _permit = self
                    .inner
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| RegistryError::Cancelled)?;
                tokio::time::timeout(options.timeout, self.exchange(endpoint, call)).await
            };

            let last = attempt + 1 == attempts;
            let delay = match outcome {
                Ok(Ok(response)) => match retry::classify(response.status(), response.headers()) {
                    Retry::After(delay) if !last => {
                        tracing::warn!(
                            upstream = %self.name(),
                            path = %call.path,
                            status = %response.status(),
                            attempt,
                            "retrying upstream request"
                        );
                        delay.map_or(backoff.delay, |delay| backoff.rate_limited(delay))
                    }
                    _ => return Ok(response),
                },
                Ok(Err(error)) if error.kind() == ErrorKind::UpstreamUnavailable => {
                    tracing::warn!(upstream = %self.name(), path = %call.path, %error, attempt, "upstream request failed");
                    last_error = Some(error);
                    backoff.delay
                }
                Ok(Err(error)) => return Err(error),
                Err(_) => {
                    tracing::warn!(upstream = %self.name(), path = %call.path, attempt, "upstream request timed out");
                    last_error = Some(RegistryError::UpstreamUnavailable(format!(
                        "{} timed out after {:?}",
                        call.path, options.timeout
                    )));
                    backoff.delay
                }
            };

            if !last {
                tokio::time::sleep(delay).await;
                backoff = backoff.increment();
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RegistryError::UpstreamUnavailable(format!("{} failed", call.path))
        }))
    }

    /// One attempt against one endpoint: authentication and redirects.
    async fn exchange(
        &self,
        endpoint: &Uri,
        call: &Call,
    ) -> RegistryResult<http::Response<hyperdriver::Body>> {
        let mut uri = join(endpoint, &call.path)?;
        let mut authorization = self.cached_token(&call.scope);
        let mut challenged = false;

        for _ in 0..=self.inner.options.max_redirects {
            let same_origin = uri.authority() == endpoint.authority();
            let mut request = http::Request::builder()
                .method(call.method.clone())
                .uri(uri.clone())
                .body(hyperdriver::Body::empty())
                .map_err(invalid_url)?;
            request.headers_mut().extend(call.headers.clone());
            if same_origin {
                if let Some(value) = &authorization {
                    request
                        .headers_mut()
                        .insert(header::AUTHORIZATION, value.clone());
                }
            }

            let response = self
                .inner
                .service
                .clone()
                .oneshot(request)
                .await
                .map_err(|error| RegistryError::UpstreamUnavailable(error.to_string()))?;

            match response.status() {
                StatusCode::UNAUTHORIZED if same_origin && !challenged => {
                    challenged = true;
                    let Some(challenge) = response
                        .headers()
                        .get(header::WWW_AUTHENTICATE)
                        .and_then(|value| value.to_str().ok())
                        .and_then(Challenge::parse)
                    else {
                        return Ok(response);
                    };
                    tracing::debug!(upstream = %self.name(), scope = %call.scope, "answering auth challenge");
                    let rejected = authorization.is_some();
                    authorization = Some(self.authorize(challenge, &call.scope, rejected).await?);
                }
                status if status.is_redirection() && status != StatusCode::NOT_MODIFIED => {
                    let location = response
                        .headers()
                        .get(header::LOCATION)
                        .and_then(|value| value.to_str().ok())
                        .ok_or_else(|| {
                            RegistryError::UpstreamUnavailable(format!(
                                "{status} without a location"
                            ))
                        })?;
                    uri = resolve(&uri, location)?;
                    tracing::trace!(%uri, "following redirect");
                }
                _ => return Ok(response),
            }
        }

        Err(RegistryError::UpstreamUnavailable(format!(
            "too many redirects for {}",
            call.path
        )))
    }

    /// Produce an `Authorization` value answering `challenge`.
    async fn authorize(
        &self,
        challenge: Challenge,
        scope: &str,
        rejected: bool,
    ) -> RegistryResult<HeaderValue> {
        match challenge.scheme {
            Scheme::Basic => {
                let login = self.inner.login.load_full().ok_or_else(|| {
                    RegistryError::Unauthorized(format!("{} requires credentials", self.name()))
                })?;
                login
                    .basic()
                    .map_err(|error| RegistryError::Unauthorized(error.to_string()))
            }
            Scheme::Bearer => {
                let cache = self
                    .inner
                    .tokens
                    .entry(scope.to_owned())
                    .or_insert_with(|| Cached::new(None))
                    .clone();
                if rejected {
                    cache.clear();
                }

                let mut token = cache
                    .try_get(|| self.fetch_token(challenge.clone(), scope.to_owned()))
                    .await?;
                if !token.is_fresh() {
                    cache.clear();
                    token = cache
                        .try_get(|| self.fetch_token(challenge, scope.to_owned()))
                        .await?;
                }
                Ok(token.header)
            }
        }
    }

    fn fetch_token(&self, challenge: Challenge, scope: String) -> BoxFut<'static, Result<Token, Failure>> {
        let upstream = self.clone();
        Box::pin(async move {
            upstream
                .request_token(&challenge, &scope)
                .await
                .map_err(Failure::from)
        })
    }

    #[tracing::instrument(skip(self, challenge), fields(upstream = %self.name()))]
    async fn request_token(&self, challenge: &Challenge, scope: &str) -> RegistryResult<Token> {
        let realm = challenge
            .realm
            .as_deref()
            .ok_or_else(|| RegistryError::Unauthorized("challenge has no realm".into()))?;
        let scope = challenge.scope.as_deref().unwrap_or(scope);

        let mut query = Vec::new();
        if let Some(service) = challenge.service.as_deref() {
            query.push(("service", service));
        }
        query.push(("scope", scope));
        let query = serde_urlencoded::to_string(&query)
            .map_err(|error| RegistryError::Unauthorized(error.to_string()))?;
        let separator = if realm.contains('?') { '&' } else { '?' };
        let uri: Uri = format!("{realm}{separator}{query}")
            .parse()
            .map_err(invalid_url)?;

        let mut request = http::Request::get(uri)
            .body(hyperdriver::Body::empty())
            .map_err(invalid_url)?;
        if let Some(login) = self.inner.login.load_full() {
            let value = login
                .basic()
                .map_err(|error| RegistryError::Unauthorized(error.to_string()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let response = self
            .inner
            .service
            .clone()
            .oneshot(request)
            .await
            .map_err(|error| {
                RegistryError::UpstreamUnavailable(format!("token request failed: {error}"))
            })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(RegistryError::Unauthorized(format!(
                    "token realm rejected credentials for {scope}"
                )));
            }
            status => {
                return Err(RegistryError::UpstreamUnavailable(format!(
                    "token realm returned {status}"
                )));
            }
        }

        let body = collect(response.into_body()).await?;
        let token: TokenResponse = serde_json::from_slice(&body)
            .map_err(|error| RegistryError::Unauthorized(format!("bad token response: {error}")))?;
        token
            .into_token()
            .ok_or_else(|| RegistryError::Unauthorized("token response has no token".into()))
    }

    /// Every tag of `repository`, following `Link` pagination.
    #[tracing::instrument(skip(self), fields(upstream = %self.name()))]
    pub async fn list_tags(&self, repository: &str) -> RegistryResult<Vec<String>> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let mut tags = Vec::new();
        let mut next = Some(format!("/v2/{repository}/tags/list"));
        let mut pages = 0;
        while let Some(path) = next.take() {
            pages += 1;
            if pages > MAX_TAG_PAGES {
                return Err(RegistryError::UpstreamUnavailable(format!(
                    "tag listing for {repository} did not terminate"
                )));
            }

            let response = self.send(&Call::new(Method::GET, path, repository)).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_error(
                    status,
                    format!("tags of {repository}"),
                    RegistryError::ManifestNotFound,
                ));
            }

            next = next_link(response.headers());
            let body = collect(response.into_body()).await?;
            let page: TagList = serde_json::from_slice(&body)?;
            tags.extend(page.tags.unwrap_or_default());
        }

        tracing::debug!(count = tags.len(), "listed upstream tags");
        Ok(tags)
    }

    /// Resolve a tag to its manifest digest.
    ///
    /// Uses `HEAD` and the `Docker-Content-Digest` header, falling back to fetching and hashing
    /// the manifest when the header is missing or `HEAD` is unsupported.
    #[tracing::instrument(skip(self), fields(upstream = %self.name()))]
    pub async fn resolve_tag(&self, repository: &str, tag: &str) -> RegistryResult<Digest> {
        let path = format!("/v2/{repository}/manifests/{tag}");
        let response = self
            .send(&Call::new(Method::HEAD, path, repository).accept_manifests())
            .await?;

        let status = response.status();
        if status.is_success() {
            let digest = response
                .headers()
                .get(DOCKER_CONTENT_DIGEST)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<Digest>().ok());
            if let Some(digest) = digest {
                return Ok(digest);
            }
            tracing::debug!("no digest header, falling back to GET");
        } else if matches!(
            status,
            StatusCode::NOT_FOUND
                | StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::TOO_MANY_REQUESTS
        ) {
            return Err(status_error(
                status,
                format!("{repository}:{tag}"),
                RegistryError::ManifestNotFound,
            ));
        }

        Ok(self.fetch_manifest(repository, tag).await?.digest)
    }

    /// Fetch and parse a manifest by tag or digest.
    ///
    /// When `reference` is a digest the bytes are verified against it, and a mismatch is retried
    /// on the next endpoint.
    #[tracing::instrument(skip(self), fields(upstream = %self.name()))]
    pub async fn fetch_manifest(&self, repository: &str, reference: &str) -> RegistryResult<Manifest> {
        let expected = reference.parse::<Digest>().ok();
        let path = format!("/v2/{repository}/manifests/{reference}");
        let attempts = self.inner.options.attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let call = Call::new(Method::GET, path.clone(), repository)
                .accept_manifests()
                .offset(attempt);
            let response = self.send(&call).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_error(
                    status,
                    format!("{repository}@{reference}"),
                    RegistryError::ManifestNotFound,
                ));
            }

            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let bytes = collect(response.into_body()).await?;
            let parsed = match &expected {
                Some(digest) => Manifest::parse_verified(content_type.as_deref(), bytes, digest),
                None => Manifest::parse(content_type.as_deref(), bytes, Algorithm::Sha256),
            };

            match parsed {
                Err(error @ RegistryError::DigestMismatch { .. }) => {
                    tracing::warn!(%error, attempt, "manifest failed verification");
                    last_error = Some(error);
                }
                other => return other,
            }
        }

        Err(last_error.unwrap_or_else(|| RegistryError::ManifestNotFound(reference.to_owned())))
    }

    /// Open a blob download, optionally for a byte range.
    pub async fn fetch_blob(
        &self,
        repository: &str,
        digest: &Digest,
        range: Option<ByteRange>,
    ) -> RegistryResult<BlobResponse> {
        self.fetch_blob_from(repository, digest, range, 0).await
    }

    async fn fetch_blob_from(
        &self,
        repository: &str,
        digest: &Digest,
        range: Option<ByteRange>,
        offset: usize,
    ) -> RegistryResult<BlobResponse> {
        let path = format!("/v2/{repository}/blobs/{digest}");
        let mut call = Call::new(Method::GET, path, repository).offset(offset);
        if let Some(range) = range {
            let value = HeaderValue::try_from(range.header()).map_err(invalid_url)?;
            call = call.header(header::RANGE, value);
        }

        let response = self.send(&call).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(
                status,
                format!("{repository}@{digest}"),
                RegistryError::BlobNotFound,
            ));
        }

        let partial = status == StatusCode::PARTIAL_CONTENT;
        let length = content_length(response.headers());
        let total = if partial {
            content_range_total(response.headers())
        } else {
            length
        };
        Ok(BlobResponse {
            partial,
            length,
            total,
            body: response.into_body(),
        })
    }

    /// Stream a blob into `sink` without verifying it. Returns the bytes written.
    ///
    /// A body that breaks off early is resumed with a range request from the last byte
    /// written. When the upstream ignores the range, the bytes already written are skipped.
    /// `attempt` picks the endpoint to start from.
    #[tracing::instrument(skip(self, sink), fields(upstream = %self.name(), %digest))]
    pub async fn stream_blob<W>(
        &self,
        repository: &str,
        digest: &Digest,
        attempt: usize,
        mut sink: W,
    ) -> RegistryResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let limit = self.inner.options.attempts.max(1);
        let timeout = self.inner.options.timeout;
        let mut written = 0;
        let mut resumes = 0;

        loop {
            let range = (written > 0).then(|| ByteRange::from(written));
            let response = self
                .fetch_blob_from(repository, digest, range, attempt)
                .await?;
            let resumed = range.is_some() && response.partial;
            let skip = if range.is_some() && !resumed {
                tracing::debug!(written, "upstream ignored range, skipping what was written");
                written
            } else {
                0
            };

            let expected = if resumed {
                response.total
            } else {
                response.length
            };
            let end = write_body(response.body, &mut sink, skip, &mut written, timeout)
                .await
                .map_err(sink_error)?;
            let complete = match end {
                BodyEnd::Complete => expected.is_none_or(|total| written >= total),
                BodyEnd::BrokeOff(error) => {
                    tracing::debug!(%error, written, "blob body broke off");
                    false
                }
            };
            if complete {
                break;
            }

            resumes += 1;
            if resumes > limit {
                return Err(RegistryError::UpstreamUnavailable(format!(
                    "download of {digest} kept breaking off"
                )));
            }
            tracing::debug!(written, "resuming blob download");
        }

        sink.flush().await.map_err(sink_error)?;
        Ok(written)
    }

    /// Mirror a blob into `content`, verifying it on the way in. Returns the stored size.
    ///
    /// Content that fails verification is discarded and fetched again from the next
    /// endpoint, up to the attempt limit.
    #[tracing::instrument(skip(self, content), fields(upstream = %self.name(), %digest))]
    pub async fn mirror_blob(
        &self,
        repository: &str,
        digest: &Digest,
        content: &ContentStore,
    ) -> RegistryResult<u64> {
        let attempts = self.inner.options.attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let stored = content
                .put_stream(digest, |pipe| async move {
                    self.stream_blob(repository, digest, attempt, pipe)
                        .await
                        .map(drop)
                })
                .await;
            match stored {
                Ok(size) => {
                    tracing::debug!(size, "mirrored blob");
                    return Ok(size);
                }
                Err(RegistryError::DigestMismatch { expected, actual }) => {
                    tracing::warn!(%actual, attempt, "blob failed verification");
                    last_error = Some(RegistryError::DigestMismatch { expected, actual });
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| RegistryError::BlobNotFound(digest.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockUpstream;
    use super::*;
    use crate::digest::AllowedAlgorithms;
    use crate::manifest::{DOCKER_MANIFEST, OCI_INDEX};
    use storage::MemoryStorage;

    fn content() -> ContentStore {
        let storage: storage::Storage = MemoryStorage::with_buckets(&["test"]).into();
        ContentStore::new(storage.bucket("test"), AllowedAlgorithms::default())
    }

    fn manifest_body(config: &Digest, layers: &[&Digest]) -> String {
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST,
            "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "digest": config.to_string(), "size": 2},
            "layers": layers.iter().map(|d| serde_json::json!({"digest": d.to_string()})).collect::<Vec<_>>(),
        })
        .to_string()
    }

    #[test]
    fn joins_paths() {
        let base: Uri = "https://registry.example/prefix/".parse().unwrap();
        let joined = join(&base, "/v2/app/tags/list").unwrap();
        assert_eq!(joined.to_string(), "https://registry.example/prefix/v2/app/tags/list");
    }

    #[test]
    fn resolves_locations() {
        let current: Uri = "https://registry.example/v2/app/blobs/x".parse().unwrap();
        assert_eq!(
            resolve(&current, "https://cdn.example/object?sig=1").unwrap().to_string(),
            "https://cdn.example/object?sig=1"
        );
        assert_eq!(
            resolve(&current, "/elsewhere").unwrap().to_string(),
            "https://registry.example/elsewhere"
        );
        assert_eq!(
            resolve(&current, "sibling").unwrap().to_string(),
            "https://registry.example/v2/app/blobs/sibling"
        );
    }

    #[test]
    fn parses_link_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LINK,
            HeaderValue::from_static("</v2/app/tags/list?n=2&last=b>; rel=\"next\""),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("/v2/app/tags/list?n=2&last=b")
        );
    }

    #[tokio::test]
    async fn lists_tags_across_pages() {
        let mock = MockUpstream::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LINK,
            HeaderValue::from_static("<https://upstream.test/v2/app/tags/list?last=b>; rel=\"next\""),
        );
        mock.respond(
            Method::GET,
            "/v2/app/tags/list",
            StatusCode::OK,
            headers,
            r#"{"name": "app", "tags": ["a", "b"]}"#,
        );
        mock.respond(
            Method::GET,
            "/v2/app/tags/list?last=b",
            StatusCode::OK,
            HeaderMap::new(),
            r#"{"name": "app", "tags": ["c"]}"#,
        );

        let tags = mock.upstream("hub").list_tags("app").await.unwrap();
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn resolves_tags_with_head() {
        let mock = MockUpstream::new();
        let config = mock.add_blob("app", "{}");
        let digest = mock.add_manifest("app", Some("latest"), DOCKER_MANIFEST, manifest_body(&config, &[]));

        let upstream = mock.upstream("hub");
        assert_eq!(upstream.resolve_tag("app", "latest").await.unwrap(), digest);
        assert_eq!(mock.hits(Method::HEAD, "/v2/app/manifests/latest"), 1);
        assert_eq!(mock.hits(Method::GET, "/v2/app/manifests/latest"), 0);

        let err = upstream.resolve_tag("app", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn fetches_and_verifies_manifests() {
        let mock = MockUpstream::new();
        let config = mock.add_blob("app", "{}");
        let child = mock.add_manifest("app", None, DOCKER_MANIFEST, manifest_body(&config, &[]));
        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": [{"digest": child.to_string(), "platform": {"architecture": "amd64", "os": "linux"}}],
        })
        .to_string();
        let list = mock.add_manifest("app", Some("latest"), OCI_INDEX, index);

        let upstream = mock.upstream("hub");
        let manifest = upstream.fetch_manifest("app", "latest").await.unwrap();
        assert_eq!(manifest.digest, list);
        assert!(manifest.is_list());

        let manifest = upstream.fetch_manifest("app", &child.to_string()).await.unwrap();
        assert_eq!(manifest.config(), Some(&config));
    }

    #[tokio::test]
    async fn rejects_tampered_manifests() {
        let mock = MockUpstream::new();
        let claimed = Algorithm::Sha256.digest(b"something else");
        mock.respond(
            Method::GET,
            &format!("/v2/app/manifests/{claimed}"),
            StatusCode::OK,
            HeaderMap::new(),
            manifest_body(&Digest::empty_layer(), &[]),
        );

        let err = mock
            .upstream("hub")
            .fetch_manifest("app", &claimed.to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Verification);
        assert_eq!(mock.hits(Method::GET, &format!("/v2/app/manifests/{claimed}")), 3);
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let mock = MockUpstream::new();
        let digest = mock.add_blob("app", "layer data");
        let path = format!("/v2/app/blobs/{digest}");
        mock.once(Method::GET, &path, StatusCode::SERVICE_UNAVAILABLE);

        let content = content();
        let size = mock
            .upstream("hub")
            .mirror_blob("app", &digest, &content)
            .await
            .unwrap();
        assert_eq!(size, 10);
        assert_eq!(&content.get(&digest).await.unwrap()[..], b"layer data");
        assert_eq!(mock.hits(Method::GET, &path), 2);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let mock = MockUpstream::new();
        let digest = mock.add_blob("app", "layer data");
        let path = format!("/v2/app/blobs/{digest}");
        for _ in 0..3 {
            mock.once(Method::GET, &path, StatusCode::BAD_GATEWAY);
        }

        let content = content();
        let err = mock
            .upstream("hub")
            .mirror_blob("app", &digest, &content)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert!(!content.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn resumes_broken_downloads() {
        let mock = MockUpstream::new();
        let data = "0123456789".repeat(100);
        let digest = mock.add_blob("app", data.clone());
        mock.truncate_once("app", &digest);

        let content = content();
        mock.upstream("hub")
            .mirror_blob("app", &digest, &content)
            .await
            .unwrap();
        assert_eq!(content.get(&digest).await.unwrap(), Bytes::from(data));
        assert_eq!(mock.hits(Method::GET, &format!("/v2/app/blobs/{digest}")), 2);
        assert_eq!(mock.ranges_served(), 1);
    }

    #[tokio::test]
    async fn resumes_past_ignored_ranges() {
        let mock = MockUpstream::new();
        let data = "abcdefghij".repeat(100);
        let digest = mock.add_blob("app", data.clone());
        mock.truncate_once("app", &digest);
        mock.ignore_ranges();

        let mut sink = Vec::new();
        let written = mock
            .upstream("hub")
            .stream_blob("app", &digest, 0, &mut sink)
            .await
            .unwrap();
        assert_eq!(written, 1000);
        assert_eq!(sink, data.as_bytes());
        assert_eq!(mock.ranges_served(), 0);
    }

    #[tokio::test]
    async fn rejects_corrupt_blobs() {
        let mock = MockUpstream::new();
        let digest = Algorithm::Sha256.digest(b"the real thing");
        mock.add_blob_at("app", &digest, "an impostor");

        let content = content();
        let err = mock
            .upstream("hub")
            .mirror_blob("app", &digest, &content)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(content.list().await.unwrap().is_empty());
        assert_eq!(mock.hits(Method::GET, &format!("/v2/app/blobs/{digest}")), 3);
    }

    #[tokio::test]
    async fn negotiates_bearer_tokens() {
        let mock = MockUpstream::new();
        mock.require_token("sesame");
        let digest = mock.add_blob("app", "guarded");

        let upstream = mock.upstream("hub");
        let mut data = Vec::new();
        upstream.stream_blob("app", &digest, 0, &mut data).await.unwrap();
        assert_eq!(data, b"guarded");
        assert_eq!(mock.hits(Method::GET, "/token"), 1);

        // The cached token is reused.
        upstream.stream_blob("app", &digest, 0, tokio::io::sink()).await.unwrap();
        assert_eq!(mock.hits(Method::GET, "/token"), 1);
        assert_eq!(mock.hits(Method::GET, &format!("/v2/app/blobs/{digest}")), 3);
    }

    #[tokio::test]
    async fn refreshes_rejected_tokens() {
        let mock = MockUpstream::new();
        mock.require_token("first");
        let digest = mock.add_blob("app", "guarded");
        let upstream = mock.upstream("hub");
        upstream.stream_blob("app", &digest, 0, tokio::io::sink()).await.unwrap();

        mock.require_token("second");
        upstream.stream_blob("app", &digest, 0, tokio::io::sink()).await.unwrap();
        assert_eq!(mock.hits(Method::GET, "/token"), 2);
    }

    #[tokio::test]
    async fn follows_redirects_without_credentials() {
        let mock = MockUpstream::new();
        mock.require_token("sesame");
        let digest = Algorithm::Sha256.digest(b"stored elsewhere");
        mock.redirect(
            Method::GET,
            &format!("/v2/app/blobs/{digest}"),
            "https://storage.test/objects/layer",
        );
        mock.respond(
            Method::GET,
            "/objects/layer",
            StatusCode::OK,
            HeaderMap::new(),
            "stored elsewhere",
        );

        let content = content();
        mock.upstream("hub")
            .mirror_blob("app", &digest, &content)
            .await
            .unwrap();
        assert_eq!(&content.get(&digest).await.unwrap()[..], b"stored elsewhere");
        assert!(mock.authorized(Method::GET, &format!("/v2/app/blobs/{digest}")));
        assert!(!mock.authorized(Method::GET, "/objects/layer"));
    }

    #[tokio::test]
    async fn rotates_to_mirrors() {
        let mock = MockUpstream::new();
        let digest = mock.add_blob("app", "mirrored");
        let path = format!("/v2/app/blobs/{digest}");
        mock.once(Method::GET, &path, StatusCode::SERVICE_UNAVAILABLE);

        let upstream = Upstream::with_service(
            "hub",
            vec![
                "https://upstream.test".parse().unwrap(),
                "https://mirror.test".parse().unwrap(),
            ],
            mock.options(),
            mock.clone(),
        )
        .unwrap();
        upstream.stream_blob("app", &digest, 0, tokio::io::sink()).await.unwrap();
        assert_eq!(mock.hosts(), vec!["upstream.test", "mirror.test"]);
    }
}
