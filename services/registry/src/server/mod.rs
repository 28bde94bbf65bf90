//! API server builder and router

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;

use crate::catalog::Catalog;
use crate::digest::AllowedAlgorithms;
use crate::error::{RegistryError, RegistryResult};
use crate::pull_through::{PullThrough, PullThroughRule};
use crate::reference::validate_repository;

mod auth;
mod blob;
mod manifest;

pub use self::auth::AuthGate;

/// Header naming the distribution API version.
pub const API_VERSION_HEADER: &str = "docker-distribution-api-version";

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    catalog: Option<Catalog>,
    algorithms: AllowedAlgorithms,
    rules: Vec<PullThroughRule>,
    auth: Option<AuthGate>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            bucket: None,
            catalog: None,
            algorithms: AllowedAlgorithms::default(),
            rules: Vec::new(),
            auth: None,
        }
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the checksum algorithms content may be stored under
    pub fn algorithms(mut self, algorithms: AllowedAlgorithms) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Serve an existing catalog, e.g. one shared with a [`Syncer`](crate::sync::Syncer).
    ///
    /// Takes precedence over storage, bucket and algorithms.
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Add a pull-through rule. Rules are tried in the order they were added.
    pub fn pull_through(mut self, rule: PullThroughRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Require bearer tokens on every request
    pub fn auth(mut self, gate: AuthGate) -> Self {
        self.auth = Some(gate);
        self
    }

    /// Build the registry
    pub fn registry(self) -> RegistryResult<Registry> {
        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => {
                let storage = self.storage.ok_or_else(|| {
                    RegistryError::Config("storage backend must be configured".into())
                })?;
                let bucket = self.bucket.unwrap_or_else(|| "registry".to_string());
                Catalog::new(storage.bucket(bucket), self.algorithms)
            }
        };

        Ok(Registry {
            pull: PullThrough::new(catalog, self.rules),
            auth: self.auth.map(Arc::new),
        })
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> RegistryResult<Router> {
        Ok(self.registry()?.router())
    }
}

/// A configured registry.
#[derive(Debug, Clone)]
pub struct Registry {
    pull: PullThrough,
    auth: Option<Arc<AuthGate>>,
}

impl Registry {
    /// The catalog this registry serves.
    pub fn catalog(&self) -> &Catalog {
        self.pull.catalog()
    }

    /// The HTTP API.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/v2/", get(api_version_check))
            .route("/v2/{*path}", get(dispatch).head(dispatch))
            .with_state(self.pull.clone());

        // Route layer, so the gate sees the same decoded path parameters as the handlers.
        if let Some(gate) = &self.auth {
            router = router.route_layer(middleware::from_fn_with_state(
                gate.clone(),
                auth::require_token,
            ));
        }

        router.layer(middleware::map_response(api_version_header))
    }
}

/// What a request below `/v2/` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint<'a> {
    Manifest { name: &'a str, reference: &'a str },
    Blob { name: &'a str, digest: &'a str },
    Tags { name: &'a str },
}

impl<'a> Endpoint<'a> {
    /// Split a path below `/v2/` into repository name and resource.
    pub(crate) fn parse(path: &'a str) -> Option<Self> {
        if let Some(name) = path.strip_suffix("/tags/list") {
            return Some(Endpoint::Tags { name });
        }
        if let Some((name, reference)) = path.rsplit_once("/manifests/") {
            return Some(Endpoint::Manifest { name, reference });
        }
        if let Some((name, digest)) = path.rsplit_once("/blobs/") {
            return Some(Endpoint::Blob { name, digest });
        }
        None
    }

    /// The repository name.
    pub(crate) fn name(&self) -> &'a str {
        match self {
            Endpoint::Manifest { name, .. } | Endpoint::Blob { name, .. } | Endpoint::Tags { name } => {
                name
            }
        }
    }
}

/// Tag list pagination.
#[derive(Debug, Default, Deserialize)]
struct TagsQuery {
    n: Option<usize>,
    last: Option<String>,
}

async fn dispatch(
    State(pull): State<PullThrough>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<TagsQuery>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let endpoint =
        Endpoint::parse(&path).ok_or_else(|| RegistryError::RepositoryNotFound(path.clone()))?;
    validate_repository(endpoint.name())?;
    let head = method == Method::HEAD;

    match endpoint {
        Endpoint::Manifest { name, reference } => {
            manifest::serve(&pull, name, reference, &headers, head).await
        }
        Endpoint::Blob { name, digest } => blob::serve(&pull, name, digest, &headers, head).await,
        Endpoint::Tags { name } => list_tags(&pull, name, query).await,
    }
}

/// List tags, sorted, honouring `n` and `last`.
async fn list_tags(pull: &PullThrough, name: &str, query: TagsQuery) -> RegistryResult<Response> {
    let mut tags = pull.tags(name).await?;
    if let Some(last) = &query.last {
        tags.retain(|tag| tag > last);
    }

    let mut next = None;
    if let Some(n) = query.n {
        if tags.len() > n {
            tags.truncate(n);
            next = tags
                .last()
                .map(|last| format!("</v2/{name}/tags/list?n={n}&last={last}>; rel=\"next\""));
        }
    }

    let mut response = Json(json!({ "name": name, "tags": tags })).into_response();
    if let Some(value) = next.and_then(|link| HeaderValue::try_from(link).ok()) {
        response.headers_mut().insert(header::LINK, value);
    }
    Ok(response)
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

async fn api_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        API_VERSION_HEADER,
        HeaderValue::from_static("registry/2.0"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let storage = storage::MemoryStorage::with_buckets(&["test"]);
        let _registry = RegistryBuilder::new()
            .storage(storage.into())
            .bucket("test")
            .build()
            .unwrap();
    }

    #[test]
    fn builder_requires_storage() {
        assert!(matches!(
            RegistryBuilder::new().build(),
            Err(RegistryError::Config(_))
        ));
    }

    #[test]
    fn endpoints() {
        assert_eq!(
            Endpoint::parse("library/alpine/manifests/latest"),
            Some(Endpoint::Manifest {
                name: "library/alpine",
                reference: "latest"
            })
        );
        assert_eq!(
            Endpoint::parse("hub/library/alpine/blobs/sha256:abc"),
            Some(Endpoint::Blob {
                name: "hub/library/alpine",
                digest: "sha256:abc"
            })
        );
        assert_eq!(
            Endpoint::parse("alpine/tags/list"),
            Some(Endpoint::Tags { name: "alpine" })
        );
        assert_eq!(Endpoint::parse("alpine"), None);
    }
}
