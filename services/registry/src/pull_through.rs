//! Serving reads, filling misses from upstream registries.
//!
//! A read is answered from the catalog when the repository holds what was asked for. When it
//! does not and a [`PullThroughRule`] covers the repository, the content is fetched from the
//! rule's upstream, verified, committed, and attached to the repository before it is served.
//! Concurrent misses for the same manifest reference or blob digest share one upstream fetch.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use echocache::{BoxFut, Coalesce};

use crate::catalog::{COMMIT_ATTEMPTS, Catalog, ManifestRecord, RepositoryRecord};
use crate::digest::Digest;
use crate::error::{ErrorKind, Failure, RegistryError, RegistryResult};
use crate::filter::Filter;
use crate::reference::Reference;
use crate::upstream::Upstream;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mapping {
    /// `<prefix><name>` locally is `<name>` upstream.
    Prefix(String),

    /// One local repository mirrors one upstream repository.
    Exact { local: String, upstream: String },
}

/// Which local repositories are filled from which upstream.
#[derive(Debug, Clone)]
pub struct PullThroughRule {
    mapping: Mapping,
    upstream: Upstream,
    repositories: Filter,
    manifests: bool,
}

impl PullThroughRule {
    /// Serve every repository under `prefix` from `upstream`, with the prefix stripped.
    ///
    /// A prefix without a trailing `/` gets one.
    pub fn prefix(prefix: impl Into<String>, upstream: Upstream) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        PullThroughRule {
            mapping: Mapping::Prefix(prefix),
            upstream,
            repositories: Filter::all(),
            manifests: true,
        }
    }

    /// Serve the local repository `local` from `upstream_repository` on `upstream`.
    pub fn exact(
        local: impl Into<String>,
        upstream_repository: impl Into<String>,
        upstream: Upstream,
    ) -> Self {
        PullThroughRule {
            mapping: Mapping::Exact {
                local: local.into(),
                upstream: upstream_repository.into(),
            },
            upstream,
            repositories: Filter::all(),
            manifests: true,
        }
    }

    /// Only cover upstream repository names passing `filter`.
    pub fn repositories(mut self, filter: Filter) -> Self {
        self.repositories = filter;
        self
    }

    /// Only fetch blobs the repository already holds but has not downloaded.
    ///
    /// Used for synced repositories with on-demand layers: tags stay under the control of
    /// the sync, and nothing outside the synced graph is fetched.
    pub fn blobs_only(mut self) -> Self {
        self.manifests = false;
        self
    }

    /// The upstream this rule pulls from.
    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// The upstream repository name for a local one, if this rule covers it.
    pub fn upstream_name(&self, repository: &str) -> Option<String> {
        let name = match &self.mapping {
            Mapping::Prefix(prefix) => repository.strip_prefix(prefix.as_str())?.to_owned(),
            Mapping::Exact { local, upstream } if local == repository => upstream.clone(),
            Mapping::Exact { .. } => return None,
        };
        (!name.is_empty() && self.repositories.matches(&name)).then_some(name)
    }
}

/// Where the bytes of a served blob are.
#[derive(Debug, Clone)]
pub enum BlobSource {
    /// In the content store.
    Local,

    /// Just fetched from an upstream into the content store, with its size.
    Fetched(u64),
}

/// A resolved upstream route for one request.
#[derive(Debug, Clone)]
struct Route {
    upstream: Upstream,
    repository: String,
    manifests: bool,
}

/// Answers reads for the served API.
#[derive(Debug, Clone)]
pub struct PullThrough {
    catalog: Catalog,
    rules: Arc<[PullThroughRule]>,
    manifests: Coalesce<String, Result<Digest, Failure>>,
    blobs: Coalesce<Digest, Result<u64, Failure>>,
}

impl PullThrough {
    /// Serve from `catalog`, filling misses according to `rules`. The first matching rule wins.
    pub fn new(catalog: Catalog, rules: Vec<PullThroughRule>) -> Self {
        PullThrough {
            catalog,
            rules: rules.into(),
            manifests: Coalesce::new(),
            blobs: Coalesce::new(),
        }
    }

    /// The catalog reads are answered from.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn route(&self, repository: &str) -> Option<Route> {
        self.rules.iter().find_map(|rule| {
            rule.upstream_name(repository).map(|name| Route {
                upstream: rule.upstream.clone(),
                repository: name,
                manifests: rule.manifests,
            })
        })
    }

    /// Whether reads from `repository` may reach an upstream.
    pub fn is_pull_through(&self, repository: &str) -> bool {
        self.route(repository).is_some_and(|route| route.manifests)
    }

    /// Tags of a local repository, sorted.
    ///
    /// Pull-through repositories which have not been read yet have no tags rather than being
    /// unknown.
    pub async fn tags(&self, repository: &str) -> RegistryResult<Vec<String>> {
        match self.catalog.repository(repository).await? {
            Some(record) => Ok(record.tags.into_keys().collect()),
            None if self.is_pull_through(repository) => Ok(Vec::new()),
            None => Err(RegistryError::RepositoryNotFound(repository.to_owned())),
        }
    }

    async fn local_manifest(
        &self,
        repository: Option<&RepositoryRecord>,
        reference: &Reference,
    ) -> RegistryResult<Option<Digest>> {
        let Some(record) = repository else {
            return Ok(None);
        };
        let digest = match reference {
            Reference::Tag(tag) => record.tags.get(tag).cloned(),
            Reference::Digest(digest) => record.holds(digest).then(|| digest.clone()),
        };
        match digest {
            Some(digest) if self.catalog.record(&digest).await?.is_some() => Ok(Some(digest)),
            _ => Ok(None),
        }
    }

    /// Look up a manifest, pulling it through when the repository allows.
    ///
    /// Tags in pull-through repositories are re-checked against the upstream on every read.
    /// A re-check which fails serves the local copy.
    #[tracing::instrument(skip(self), fields(%reference))]
    pub async fn manifest(
        &self,
        repository: &str,
        reference: &Reference,
    ) -> RegistryResult<(ManifestRecord, Bytes)> {
        let not_found = || RegistryError::ManifestNotFound(format!("{repository}:{reference}"));
        let record = self.catalog.repository(repository).await?;
        let local = self.local_manifest(record.as_ref(), reference).await?;

        let route = self.route(repository).filter(|route| route.manifests);
        let digest = match (local, route) {
            (Some(digest), None) => digest,
            (Some(digest), Some(_)) if matches!(reference, Reference::Digest(_)) => digest,
            (None, None) => return Err(not_found()),
            (_, Some(route)) => {
                let key = format!("{repository}@{reference}");
                let task = Pull {
                    catalog: self.catalog.clone(),
                    upstream: route.upstream,
                    upstream_repository: route.repository,
                    repository: repository.to_owned(),
                    reference: reference.clone(),
                };
                let shared = self
                    .manifests
                    .get(key, move || {
                        Box::pin(async move { task.run().await.map_err(Failure::from) })
                    })
                    .await
                    .map_err(Failure::from)
                    .and_then(|result| result);
                shared.map_err(|failure| surface(failure, not_found))?
            }
        };

        self.catalog.manifest(&digest).await
    }

    /// Find a blob, pulling it through when the repository allows.
    ///
    /// Synced repositories serve what they hold. A repository covered by a full pull-through
    /// rule serves anything stored, and otherwise fetches from its upstream. A blobs-only rule
    /// fetches only blobs the repository holds but has not downloaded.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn blob(&self, repository: &str, digest: &Digest) -> RegistryResult<BlobSource> {
        let not_found = || RegistryError::BlobNotFound(digest.to_string());
        let held = digest.is_empty_layer()
            || self
                .catalog
                .repository(repository)
                .await?
                .is_some_and(|record| record.holds(digest));
        let route = self.route(repository);
        let stored = self.catalog.content().exists(digest).await?;

        if stored && (held || route.as_ref().is_some_and(|route| route.manifests)) {
            return Ok(BlobSource::Local);
        }

        let Some(route) = route else {
            return Err(not_found());
        };
        if !held && !route.manifests {
            return Err(not_found());
        }

        let content = self.catalog.content().clone();
        let upstream = route.upstream;
        let upstream_repository = route.repository;
        let target = digest.clone();
        let shared = self
            .blobs
            .get(digest.clone(), move || {
                Box::pin(async move {
                    let size = upstream
                        .mirror_blob(&upstream_repository, &target, &content)
                        .await
                        .map_err(Failure::from)?;
                    tracing::info!(digest = %target, size, "pulled blob through");
                    Ok(size)
                })
            })
            .await
            .map_err(Failure::from)
            .and_then(|result| result);

        shared
            .map(BlobSource::Fetched)
            .map_err(|failure| surface(failure, not_found))
    }
}

/// Turn an upstream failure into what a client sees: rate limits pass through, local storage
/// failures stay internal errors, everything else is not found.
fn surface(failure: Failure, not_found: impl FnOnce() -> RegistryError) -> RegistryError {
    match failure.kind {
        ErrorKind::RateLimited => RegistryError::RateLimited(failure.message),
        ErrorKind::Storage => RegistryError::Failed(failure),
        _ => {
            tracing::warn!(%failure, "pull-through failed");
            not_found()
        }
    }
}

/// One pull of a manifest reference into a repository.
#[derive(Debug)]
struct Pull {
    catalog: Catalog,
    upstream: Upstream,
    upstream_repository: String,
    repository: String,
    reference: Reference,
}

impl Pull {
    async fn run(self) -> RegistryResult<Digest> {
        let target = match &self.reference {
            Reference::Digest(digest) => digest.clone(),
            Reference::Tag(tag) => {
                let local = self
                    .catalog
                    .repository(&self.repository)
                    .await?
                    .and_then(|record| record.tags.get(tag).cloned());
                match self.upstream.resolve_tag(&self.upstream_repository, tag).await {
                    Ok(digest) => digest,
                    Err(error) => match local {
                        Some(digest) => {
                            tracing::warn!(%error, %digest, "tag re-check failed, serving local copy");
                            return Ok(digest);
                        }
                        None => return Err(error),
                    },
                }
            }
        };

        let mut attempt = 1;
        loop {
            let sweeps = self.catalog.sweeps();
            self.fetch(target.clone()).await?;

            let guard = self.catalog.commit_guard().await;
            if self.catalog.sweeps() != sweeps && !self.catalog.intact(&target, |_| false).await? {
                drop(guard);
                if attempt == COMMIT_ATTEMPTS {
                    return Err(RegistryError::InconsistentGraph(format!(
                        "{target} was swept before it could be attached"
                    )));
                }
                attempt += 1;
                tracing::warn!(digest = %target, attempt, "manifest swept during pull, pulling again");
                continue;
            }

            let removed = self.attach(&target).await?;
            drop(guard);

            self.catalog.delete_unreferenced(removed).await?;
            return Ok(target);
        }
    }

    /// Store a manifest and, for lists, every platform manifest below it. Blobs are left to
    /// be pulled when they are read.
    fn fetch(&self, digest: Digest) -> BoxFut<'_, RegistryResult<()>> {
        Box::pin(async move {
            if let Some(record) = self.catalog.record(&digest).await? {
                if self.catalog.content().exists(&digest).await? {
                    futures::future::try_join_all(
                        record.manifests.into_iter().map(|child| self.fetch(child)),
                    )
                    .await?;
                    return Ok(());
                }
            }

            let manifest = self
                .upstream
                .fetch_manifest(&self.upstream_repository, &digest.to_string())
                .await?;
            futures::future::try_join_all(
                manifest.children().map(|child| self.fetch(child.digest.clone())),
            )
            .await?;
            self.catalog.commit_manifest(&manifest).await?;
            tracing::info!(%digest, media_type = %manifest.media_type, "pulled manifest through");
            Ok(())
        })
    }

    /// Point the repository at `digest`, returning what it stopped holding.
    async fn attach(&self, digest: &Digest) -> RegistryResult<BTreeSet<Digest>> {
        let _lock = self.catalog.lock_repository(&self.repository).await;
        let mut record = self
            .catalog
            .repository(&self.repository)
            .await?
            .unwrap_or_else(|| RepositoryRecord::new(&self.repository));

        let changed = match &self.reference {
            Reference::Tag(tag) => record.tags.insert(tag.clone(), digest.clone()).as_ref() != Some(digest),
            Reference::Digest(_) => record.pinned.insert(digest.clone()),
        };
        if !changed && record.holds(digest) {
            return Ok(BTreeSet::new());
        }

        let before = std::mem::take(&mut record.content);
        record.content = self.catalog.reachable(&record).await?;
        record.updated = chrono::Utc::now();
        self.catalog.save_repository(&record).await?;
        Ok(before.difference(&record.content).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::Method;
    use storage::MemoryStorage;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::digest::{Algorithm, AllowedAlgorithms};
    use crate::sync::{SyncOptions, SyncState, Syncer};
    use crate::upstream::mock::MockUpstream;

    fn catalog() -> Catalog {
        let storage: storage::Storage = MemoryStorage::with_buckets(&["registry"]).into();
        Catalog::new(storage.bucket("registry"), AllowedAlgorithms::default())
    }

    fn hub(mock: &MockUpstream) -> PullThrough {
        PullThrough::new(
            catalog(),
            vec![PullThroughRule::prefix("hub", mock.upstream("hub"))],
        )
    }

    fn tag(name: &str) -> Reference {
        Reference::Tag(name.to_owned())
    }

    #[test]
    fn rules_map_names() {
        let mock = MockUpstream::new();
        let rule = PullThroughRule::prefix("hub", mock.upstream("hub"))
            .repositories(Filter::only(["library/*"]));
        assert_eq!(rule.upstream_name("hub/library/alpine").as_deref(), Some("library/alpine"));
        assert_eq!(rule.upstream_name("hub/someone/app"), None);
        assert_eq!(rule.upstream_name("hub/"), None);
        assert_eq!(rule.upstream_name("local/app"), None);

        let rule = PullThroughRule::exact("alpine", "library/alpine", mock.upstream("hub"));
        assert_eq!(rule.upstream_name("alpine").as_deref(), Some("library/alpine"));
        assert_eq!(rule.upstream_name("alpine/sub"), None);
    }

    #[tokio::test]
    async fn pulls_tags_through() {
        let mock = MockUpstream::new();
        let digest = mock.add_image("library/alpine", Some("3.19"), "cfg", &["layer"]);
        let pull = hub(&mock);

        let (record, bytes) = pull
            .manifest("hub/library/alpine", &tag("3.19"))
            .await
            .unwrap();
        assert_eq!(record.digest, digest);
        assert_eq!(Algorithm::Sha256.digest(&bytes), digest);

        let repository = pull.catalog().repository("hub/library/alpine").await.unwrap().unwrap();
        assert_eq!(repository.tags["3.19"], digest);
        assert!(repository.holds(&Algorithm::Sha256.digest(b"layer")));
        assert_eq!(pull.tags("hub/library/alpine").await.unwrap(), vec!["3.19"]);

        // Layers come through on first read.
        let layer = Algorithm::Sha256.digest(b"layer");
        assert!(matches!(
            pull.blob("hub/library/alpine", &layer).await.unwrap(),
            BlobSource::Fetched(_)
        ));
        assert!(matches!(
            pull.blob("hub/library/alpine", &layer).await.unwrap(),
            BlobSource::Local
        ));
        assert_eq!(
            mock.hits(Method::GET, &format!("/v2/library/alpine/blobs/{layer}")),
            1
        );
    }

    #[tokio::test]
    async fn pulls_lists_with_their_platforms() {
        let mock = MockUpstream::new();
        let amd64 = mock.add_image("library/app", None, "cfg-a", &["a"]);
        let arm64 = mock.add_image("library/app", None, "cfg-b", &["b"]);
        let index = mock.add_index("library/app", Some("latest"), &[("amd64", &amd64), ("arm64", &arm64)]);
        let pull = hub(&mock);

        let (record, _) = pull.manifest("hub/library/app", &tag("latest")).await.unwrap();
        assert_eq!(record.digest, index);
        assert!(pull.catalog().record(&amd64).await.unwrap().is_some());
        assert!(pull.catalog().record(&arm64).await.unwrap().is_some());

        let (child, _) = pull
            .manifest("hub/library/app", &Reference::Digest(arm64.clone()))
            .await
            .unwrap();
        assert_eq!(child.digest, arm64);
        assert_eq!(
            mock.hits(Method::GET, &format!("/v2/library/app/manifests/{arm64}")),
            1
        );
    }

    #[tokio::test]
    async fn missing_upstream_content_is_not_found() {
        let mock = MockUpstream::new();
        let pull = hub(&mock);

        let err = pull.manifest("hub/library/nope", &tag("latest")).await.unwrap_err();
        assert!(matches!(err, RegistryError::ManifestNotFound(_)));
        let digest = Algorithm::Sha256.digest(b"absent");
        let err = pull.blob("hub/library/nope", &digest).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobNotFound(_)));

        assert!(pull.catalog().repository("hub/library/nope").await.unwrap().is_none());
        assert!(pull.catalog().content().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrouted_misses_never_reach_upstream() {
        let mock = MockUpstream::new();
        mock.add_image("library/alpine", Some("latest"), "cfg", &["layer"]);
        let pull = hub(&mock);

        let err = pull.manifest("library/alpine", &tag("latest")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            pull.tags("library/alpine").await,
            Err(RegistryError::RepositoryNotFound(_))
        ));
        assert_eq!(mock.hits_under("/v2/"), 0);
    }

    #[tokio::test]
    async fn rate_limits_pass_through() {
        let mock = MockUpstream::new();
        for _ in 0..3 {
            mock.once(Method::HEAD, "/v2/library/alpine/manifests/latest", http::StatusCode::TOO_MANY_REQUESTS);
        }
        let pull = hub(&mock);
        let err = pull.manifest("hub/library/alpine", &tag("latest")).await.unwrap_err();
        assert!(matches!(err, RegistryError::RateLimited(_)));
    }

    #[tokio::test]
    async fn retagged_upstream_is_followed() {
        let mock = MockUpstream::new();
        let first = mock.add_image("library/app", Some("latest"), "cfg", &["one"]);
        let pull = hub(&mock);
        pull.manifest("hub/library/app", &tag("latest")).await.unwrap();

        let second = mock.add_image("library/app", Some("latest"), "cfg", &["two"]);
        let (record, _) = pull.manifest("hub/library/app", &tag("latest")).await.unwrap();
        assert_eq!(record.digest, second);

        // Nothing else holds the old image, so it is gone.
        assert!(pull.catalog().record(&first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_recheck_serves_local_copy() {
        let mock = MockUpstream::new();
        let digest = mock.add_image("library/app", Some("latest"), "cfg", &["one"]);
        let pull = hub(&mock);
        pull.manifest("hub/library/app", &tag("latest")).await.unwrap();

        for _ in 0..3 {
            mock.once(Method::HEAD, "/v2/library/app/manifests/latest", http::StatusCode::BAD_GATEWAY);
            mock.once(Method::GET, "/v2/library/app/manifests/latest", http::StatusCode::BAD_GATEWAY);
        }
        let (record, _) = pull.manifest("hub/library/app", &tag("latest")).await.unwrap();
        assert_eq!(record.digest, digest);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_syncs_do_not_hold_up_other_repositories() {
        let slow = MockUpstream::new();
        slow.add_image("library/big", Some("latest"), "cfg-big", &["big layer"]);
        slow.set_tags("library/big", &["latest"]);
        slow.set_delay(Duration::from_secs(1));
        let fast = MockUpstream::new();
        let alpine = fast.add_image("library/alpine", Some("3.19"), "cfg", &["layer"]);

        let catalog = catalog();
        let junk = catalog.content().put(Algorithm::Sha256, b"junk").await.unwrap();
        let sync = tokio::spawn({
            let syncer = Syncer::new(catalog.clone(), slow.upstream("slow"));
            async move {
                syncer
                    .run(&SyncOptions::new("big", "library/big"), CancellationToken::new())
                    .await
            }
        });

        // Listing and resolving take two seconds, so the run is fetching by now.
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let started = tokio::time::Instant::now();
        let sweep = tokio::spawn({
            let catalog = catalog.clone();
            async move { catalog.delete_if_unreferenced(&junk).await }
        });
        tokio::task::yield_now().await;

        let pull = PullThrough::new(
            catalog.clone(),
            vec![PullThroughRule::prefix("hub", fast.upstream("hub"))],
        );
        let (record, _) = pull
            .manifest("hub/library/alpine", &tag("3.19"))
            .await
            .unwrap();
        assert_eq!(record.digest, alpine);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(sweep.await.unwrap().unwrap());

        let run = sync.await.unwrap().unwrap();
        assert_eq!(run.state, SyncState::Completed);
        assert!(run.report.failures.is_empty());
        assert!(catalog.content().exists(&Algorithm::Sha256.digest(b"big layer")).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let mock = MockUpstream::new();
        let digest = mock.add_image("library/app", None, "cfg", &["layer"]);
        let layer = Algorithm::Sha256.digest(b"layer");
        mock.set_delay(Duration::from_millis(50));
        let pull = hub(&mock);

        let reference = Reference::Digest(digest.clone());
        let manifests = futures::future::join_all(
            (0..8).map(|_| pull.manifest("hub/library/app", &reference)),
        )
        .await;
        for result in manifests {
            assert_eq!(result.unwrap().0.digest, digest);
        }
        assert_eq!(
            mock.hits(Method::GET, &format!("/v2/library/app/manifests/{digest}")),
            1
        );

        let blobs = futures::future::join_all((0..8).map(|_| pull.blob("hub/library/app", &layer))).await;
        for result in blobs {
            result.unwrap();
        }
        assert_eq!(
            mock.hits(Method::GET, &format!("/v2/library/app/blobs/{layer}")),
            1
        );
    }

    #[tokio::test]
    async fn corrupt_blobs_are_not_served() {
        let mock = MockUpstream::new();
        let claimed = Algorithm::Sha256.digest(b"real");
        mock.add_blob_at("library/app", &claimed, "fake");
        let pull = hub(&mock);

        let err = pull.blob("hub/library/app", &claimed).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobNotFound(_)));
        assert!(!pull.catalog().content().exists(&claimed).await.unwrap());
    }

    #[tokio::test]
    async fn blobs_only_rules_fill_pending_layers() {
        let mock = MockUpstream::new();
        mock.add_image("library/app", Some("latest"), "cfg", &["lazy"]);
        mock.set_tags("library/app", &["latest"]);
        let catalog = catalog();

        let syncer = crate::sync::Syncer::new(catalog.clone(), mock.upstream("hub"));
        let mut options = crate::sync::SyncOptions::new("app", "library/app");
        options.policy = crate::sync::DownloadPolicy::OnDemand;
        syncer
            .run(&options, tokio_util::sync::CancellationToken::new())
            .await
            .unwrap();

        let pull = PullThrough::new(
            catalog,
            vec![PullThroughRule::exact("app", "library/app", mock.upstream("hub")).blobs_only()],
        );
        let lazy = Algorithm::Sha256.digest(b"lazy");
        assert!(matches!(pull.blob("app", &lazy).await.unwrap(), BlobSource::Fetched(_)));

        // Nothing outside the synced graph is fetched.
        let stray = mock.add_blob("library/app", "stray");
        assert!(pull.blob("app", &stray).await.is_err());
        assert!(pull.manifest("app", &tag("other")).await.is_err());
    }
}
