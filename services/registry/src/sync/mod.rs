//! The sync orchestrator.
//!
//! A [`Syncer`] mirrors one upstream repository into a local one. Each call to
//! [`Syncer::run`] produces a [`SyncRun`] which moves through
//! `pending -> resolving -> fetching -> reconciling -> completed | failed`:
//!
//! - resolving lists upstream tags, applies the tag filter, and resolves each selected tag to a
//!   manifest digest. Explicit digests are added as pins.
//! - fetching walks each worklist item. Lists fan out into their platform manifests, images into
//!   their config and layer blobs. Anything already stored is reused without a network call. A
//!   list is only committed once all of its platform manifests are.
//! - reconciling points tags at what was fetched, recomputes what the repository holds, and
//!   deletes whatever no repository holds any more. Fetching happens outside the catalog's
//!   commit guard; items a sweep removed in the meantime are fetched again before they are
//!   attached.
//!
//! Failures of single items are recorded in the report and do not stop their siblings.

use std::collections::{BTreeMap, BTreeSet};

use echocache::{BoxFut, Coalesce};
use futures::StreamExt as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::catalog::{COMMIT_ATTEMPTS, Catalog, ManifestRecord, RepositoryRecord};
use crate::digest::Digest;
use crate::error::{Failure, RegistryError, RegistryResult};
use crate::filter::Filter;
use crate::upstream::Upstream;

mod report;

pub use self::report::{FailedItem, IllegalTransition, SyncProgress, SyncReport, SyncRun, SyncState};

/// When layer blobs are downloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadPolicy {
    /// Download every blob during the sync.
    #[default]
    Immediate,

    /// Download manifests and configs; fetch layers when first requested.
    OnDemand,
}

/// What to sync and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Local repository name.
    pub repository: String,

    /// Repository name on the upstream.
    pub upstream_repository: String,

    /// Tags to sync.
    #[serde(default)]
    pub tags: Filter,

    /// Manifests to sync by digest.
    #[serde(default)]
    pub digests: Vec<Digest>,

    /// Remove local tags the upstream no longer has. Needs a tag listing, so runs selecting
    /// only digests never remove tags.
    #[serde(default)]
    pub mirror: bool,

    /// Layer download policy.
    #[serde(default)]
    pub policy: DownloadPolicy,

    /// Download foreign layers too.
    #[serde(default)]
    pub include_foreign_layers: bool,

    /// Worklist items in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

impl SyncOptions {
    /// Sync every tag of `upstream_repository` into `repository`.
    pub fn new(repository: impl Into<String>, upstream_repository: impl Into<String>) -> Self {
        SyncOptions {
            repository: repository.into(),
            upstream_repository: upstream_repository.into(),
            tags: Filter::all(),
            digests: Vec::new(),
            mirror: false,
            policy: DownloadPolicy::default(),
            include_foreign_layers: false,
            concurrency: default_concurrency(),
        }
    }
}

/// The expanded selectors of a run.
#[derive(Debug, Default)]
struct Worklist {
    /// Manifest digest to the tags pointing at it.
    items: BTreeMap<Digest, Vec<String>>,

    /// Digests selected directly.
    pins: BTreeSet<Digest>,

    /// The upstream tag listing, when one was taken.
    listed: Option<BTreeSet<String>>,
}

/// Report entries gathered from concurrent items.
#[derive(Debug, Default)]
struct Tally {
    report: Mutex<SyncReport>,
}

impl Tally {
    fn fetched(&self, digest: &Digest) {
        self.report.lock().fetched.insert(digest.clone());
    }

    fn reused(&self, digest: &Digest) {
        self.report.lock().reused.insert(digest.clone());
    }

    fn pending(&self, digest: &Digest) {
        self.report.lock().pending.insert(digest.clone());
    }

    /// Whether this run stored or found `digest`.
    fn stored(&self, digest: &Digest) -> bool {
        let report = self.report.lock();
        report.fetched.contains(digest) || report.reused.contains(digest)
    }

    fn fail(&self, item: impl Into<String>, digest: Option<Digest>, error: &RegistryError) {
        let item = FailedItem::new(item, digest, error);
        tracing::warn!(item = %item.item, kind = %item.kind, message = %item.message, "sync item failed");
        self.report.lock().failures.push(item);
    }

    fn into_report(self) -> SyncReport {
        self.report.into_inner()
    }
}

/// A blob a manifest needs, and whether it is a layer.
#[derive(Debug, Clone)]
struct Wanted {
    digest: Digest,
    layer: bool,
    foreign: bool,
}

/// Mirrors an upstream repository into the catalog.
#[derive(Debug, Clone)]
pub struct Syncer {
    catalog: Catalog,
    upstream: Upstream,
    blobs: Coalesce<Digest, Result<(), Failure>>,
}

impl Syncer {
    /// Sync from `upstream` into `catalog`.
    pub fn new(catalog: Catalog, upstream: Upstream) -> Self {
        Syncer {
            catalog,
            upstream,
            blobs: Coalesce::new(),
        }
    }

    /// Run a sync to completion.
    pub async fn run(
        &self,
        options: &SyncOptions,
        cancel: CancellationToken,
    ) -> RegistryResult<SyncRun> {
        let (progress, _) = watch::channel(SyncProgress::default());
        self.run_with_progress(options, cancel, progress).await
    }

    /// Run a sync, publishing progress snapshots as it goes.
    ///
    /// Returns `Err` only when the run record itself cannot be stored. Everything else ends up
    /// in the returned run.
    #[tracing::instrument(skip_all, fields(repository = %options.repository, upstream = %self.upstream.name()))]
    pub async fn run_with_progress(
        &self,
        options: &SyncOptions,
        cancel: CancellationToken,
        progress: watch::Sender<SyncProgress>,
    ) -> RegistryResult<SyncRun> {
        let mut run = SyncRun::new(
            &options.repository,
            self.upstream.name(),
            options.tags.clone(),
            options.digests.clone(),
        );
        self.catalog.save_run(&run).await?;
        tracing::info!(run = %run.id, "sync started");

        let tally = Tally::default();
        let outcome = self
            .execute(options, &cancel, &progress, &tally, &mut run)
            .await;
        run.report = merge(std::mem::take(&mut run.report), tally.into_report());

        match outcome {
            Ok(()) => run.advance(SyncState::Completed)?,
            Err(error) => {
                tracing::warn!(run = %run.id, %error, "sync failed");
                run.fail(Failure::from(&error))?;
            }
        }

        progress.send_modify(|snapshot| snapshot.state = Some(run.state));
        self.catalog.save_run(&run).await?;
        tracing::info!(
            run = %run.id,
            state = %run.state,
            fetched = run.report.fetched.len(),
            reused = run.report.reused.len(),
            failures = run.report.failures.len(),
            "sync finished"
        );
        Ok(run)
    }

    async fn execute(
        &self,
        options: &SyncOptions,
        cancel: &CancellationToken,
        progress: &watch::Sender<SyncProgress>,
        tally: &Tally,
        run: &mut SyncRun,
    ) -> RegistryResult<()> {
        run.advance(SyncState::Resolving)?;
        progress.send_modify(|snapshot| snapshot.state = Some(SyncState::Resolving));
        let worklist = self.resolve(options, tally).await?;
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }

        run.advance(SyncState::Fetching)?;
        progress.send_modify(|snapshot| {
            snapshot.state = Some(SyncState::Fetching);
            snapshot.total = worklist.items.len();
        });

        let mut sweeps = self.catalog.sweeps();
        let mut committed = self.fetch(options, cancel, progress, tally, &worklist).await;

        run.advance(SyncState::Reconciling)?;
        progress.send_modify(|snapshot| snapshot.state = Some(SyncState::Reconciling));
        let mut attempt = 1;
        let guard = loop {
            let guard = self.catalog.commit_guard().await;
            if self.catalog.sweeps() == sweeps {
                break guard;
            }
            let lost = self.lost(&committed, tally).await?;
            if lost.is_empty() {
                break guard;
            }
            if attempt == COMMIT_ATTEMPTS || cancel.is_cancelled() {
                for digest in &lost {
                    let error = RegistryError::InconsistentGraph(format!(
                        "{digest} was swept before it could be attached"
                    ));
                    tally.fail(digest.to_string(), Some(digest.clone()), &error);
                    committed.remove(digest);
                }
                break guard;
            }

            drop(guard);
            attempt += 1;
            tracing::warn!(items = lost.len(), attempt, "content swept during fetch, fetching again");
            sweeps = self.catalog.sweeps();
            for (digest, result) in self.refetch(options, tally, lost).await {
                if let Err(error) = result {
                    tally.fail(digest.to_string(), Some(digest.clone()), &error);
                    committed.remove(&digest);
                }
            }
        };

        // Held until the repository record is saved, so nothing attached here can be swept.
        let removed = self
            .reconcile(options, &worklist, &committed, cancel.is_cancelled(), &mut run.report)
            .await?;
        drop(guard);

        run.report.deleted = self.catalog.delete_unreferenced(removed).await?;
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        Ok(())
    }

    /// Expand selectors into a deduplicated worklist.
    async fn resolve(&self, options: &SyncOptions, tally: &Tally) -> RegistryResult<Worklist> {
        let mut worklist = Worklist::default();
        let mut selected = BTreeSet::new();

        if !options.tags.is_empty() {
            let listed: BTreeSet<String> = self
                .upstream
                .list_tags(&options.upstream_repository)
                .await?
                .into_iter()
                .collect();
            selected = listed
                .iter()
                .filter(|tag| options.tags.matches(tag))
                .cloned()
                .collect();
            worklist.listed = Some(listed);
        }

        let resolved: Vec<(String, RegistryResult<Digest>)> =
            futures::stream::iter(selected.iter().cloned())
                .map(|tag| async move {
                    let digest = self
                        .upstream
                        .resolve_tag(&options.upstream_repository, &tag)
                        .await;
                    (tag, digest)
                })
                .buffer_unordered(options.concurrency.max(1))
                .collect()
                .await;

        for (tag, digest) in resolved {
            match digest {
                Ok(digest) => worklist.items.entry(digest).or_default().push(tag),
                Err(error) => tally.fail(tag, None, &error),
            }
        }
        for tags in worklist.items.values_mut() {
            tags.sort();
        }

        for digest in &options.digests {
            worklist.items.entry(digest.clone()).or_default();
            worklist.pins.insert(digest.clone());
        }

        tracing::info!(
            tags = selected.len(),
            items = worklist.items.len(),
            "resolved sync worklist"
        );
        Ok(worklist)
    }

    /// Fetch and commit every worklist item, returning those committed.
    async fn fetch(
        &self,
        options: &SyncOptions,
        cancel: &CancellationToken,
        progress: &watch::Sender<SyncProgress>,
        tally: &Tally,
        worklist: &Worklist,
    ) -> BTreeSet<Digest> {
        let results: Vec<(Digest, RegistryResult<()>)> =
            futures::stream::iter(worklist.items.keys().cloned())
                .map(|digest| async move {
                    if cancel.is_cancelled() {
                        return (digest, Err(RegistryError::Cancelled));
                    }
                    let result = self.sync_manifest(options, digest.clone(), tally).await;
                    if let Err(error) = &result {
                        tally.fail(digest.to_string(), Some(digest.clone()), error);
                    }
                    progress.send_modify(|snapshot| {
                        snapshot.done += 1;
                        snapshot.failed += usize::from(result.is_err());
                    });
                    let snapshot = progress.borrow().clone();
                    tracing::info!(%digest, done = snapshot.done, total = snapshot.total, "sync progress");
                    (digest, result)
                })
                .buffer_unordered(options.concurrency.max(1))
                .collect()
                .await;

        results
            .into_iter()
            .filter_map(|(digest, result)| result.ok().map(|()| digest))
            .collect()
    }

    /// Committed items whose content a sweep removed.
    async fn lost(&self, committed: &BTreeSet<Digest>, tally: &Tally) -> RegistryResult<BTreeSet<Digest>> {
        let mut lost = BTreeSet::new();
        for digest in committed {
            if !self.catalog.intact(digest, |blob| tally.stored(blob)).await? {
                lost.insert(digest.clone());
            }
        }
        Ok(lost)
    }

    /// Sync items again, without counting them towards progress.
    async fn refetch(
        &self,
        options: &SyncOptions,
        tally: &Tally,
        items: BTreeSet<Digest>,
    ) -> Vec<(Digest, RegistryResult<()>)> {
        futures::stream::iter(items)
            .map(|digest| async move {
                let result = self.sync_manifest(options, digest.clone(), tally).await;
                (digest, result)
            })
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await
    }

    /// Make sure a manifest and everything it references is stored, then commit it.
    fn sync_manifest<'a>(
        &'a self,
        options: &'a SyncOptions,
        digest: Digest,
        tally: &'a Tally,
    ) -> BoxFut<'a, RegistryResult<()>> {
        Box::pin(async move {
            if let Some(record) = self.catalog.record(&digest).await? {
                if self.catalog.content().exists(&digest).await? {
                    tracing::debug!(%digest, "manifest already stored");
                    tally.reused(&digest);
                    return self.complete_record(options, &record, tally).await;
                }
            }

            let manifest = self
                .upstream
                .fetch_manifest(&options.upstream_repository, &digest.to_string())
                .await?;
            tally.fetched(&digest);

            if manifest.is_list() {
                let children = manifest.children().map(|child| child.digest.clone()).collect();
                self.sync_children(options, &digest, children, tally).await?;
            } else {
                let wanted = manifest
                    .config()
                    .map(|config| Wanted {
                        digest: config.clone(),
                        layer: false,
                        foreign: false,
                    })
                    .into_iter()
                    .chain(manifest.layers().iter().map(|layer| Wanted {
                        digest: layer.digest.clone(),
                        layer: true,
                        foreign: layer.foreign,
                    }))
                    .collect();
                self.ensure_blobs(options, wanted, tally).await?;
            }

            self.catalog.commit_manifest(&manifest).await?;
            tracing::debug!(%digest, media_type = %manifest.media_type, "committed manifest");
            Ok(())
        })
    }

    /// Sync every platform manifest of a list. All of them are attempted, and all of them
    /// must succeed.
    async fn sync_children(
        &self,
        options: &SyncOptions,
        list: &Digest,
        children: Vec<Digest>,
        tally: &Tally,
    ) -> RegistryResult<()> {
        let results = futures::future::join_all(children.into_iter().map(|child| async move {
            let result = self.sync_manifest(options, child.clone(), tally).await;
            (child, result)
        }))
        .await;

        let mut unresolved = Vec::new();
        for (child, result) in results {
            if let Err(error) = result {
                tally.fail(child.to_string(), Some(child.clone()), &error);
                unresolved.push(child.to_string());
            }
        }

        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::InconsistentGraph(format!(
                "{list} has unresolved platform manifests: {}",
                unresolved.join(", ")
            )))
        }
    }

    /// Fill in anything missing below an already stored manifest.
    async fn complete_record(
        &self,
        options: &SyncOptions,
        record: &ManifestRecord,
        tally: &Tally,
    ) -> RegistryResult<()> {
        if !record.manifests.is_empty() {
            self.sync_children(options, &record.digest, record.manifests.clone(), tally)
                .await?;
        }

        let wanted = record
            .config
            .iter()
            .map(|config| Wanted {
                digest: config.clone(),
                layer: false,
                foreign: false,
            })
            .chain(record.layers.iter().map(|layer| Wanted {
                digest: layer.clone(),
                layer: true,
                foreign: record.foreign.contains(layer),
            }))
            .collect();
        self.ensure_blobs(options, wanted, tally).await
    }

    /// Download whichever of `wanted` is not stored yet, honouring the download policy.
    async fn ensure_blobs(
        &self,
        options: &SyncOptions,
        wanted: Vec<Wanted>,
        tally: &Tally,
    ) -> RegistryResult<()> {
        let results: Vec<RegistryResult<()>> = futures::stream::iter(wanted)
            .map(|blob| async move {
                if blob.digest.is_empty_layer() {
                    return Ok(());
                }
                if blob.foreign && !options.include_foreign_layers {
                    tracing::trace!(digest = %blob.digest, "skipping foreign layer");
                    return Ok(());
                }
                if self.catalog.content().exists(&blob.digest).await? {
                    tally.reused(&blob.digest);
                    return Ok(());
                }
                if blob.layer && options.policy == DownloadPolicy::OnDemand {
                    tally.pending(&blob.digest);
                    return Ok(());
                }

                self.download(&options.upstream_repository, &blob.digest)
                    .await?;
                tally.fetched(&blob.digest);
                Ok(())
            })
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Download and store one blob. Concurrent requests for a digest share one download.
    async fn download(&self, repository: &str, digest: &Digest) -> RegistryResult<()> {
        let upstream = self.upstream.clone();
        let content = self.catalog.content().clone();
        let repository = repository.to_owned();
        let key = digest.clone();
        let digest = digest.clone();
        self.blobs
            .get(key, move || {
                Box::pin(async move {
                    upstream
                        .mirror_blob(&repository, &digest, &content)
                        .await
                        .map(drop)
                        .map_err(Failure::from)
                })
            })
            .await
            .map_err(Failure::from)??;
        Ok(())
    }

    /// Point tags at committed items and recompute what the repository holds.
    ///
    /// Returns the digests the repository stopped holding.
    async fn reconcile(
        &self,
        options: &SyncOptions,
        worklist: &Worklist,
        committed: &BTreeSet<Digest>,
        cancelled: bool,
        report: &mut SyncReport,
    ) -> RegistryResult<BTreeSet<Digest>> {
        let _lock = self.catalog.lock_repository(&options.repository).await;
        let mut record = self
            .catalog
            .repository(&options.repository)
            .await?
            .unwrap_or_else(|| RepositoryRecord::new(&options.repository));
        let before = record.content.clone();

        for (digest, tags) in &worklist.items {
            if !committed.contains(digest) {
                continue;
            }
            for tag in tags {
                if record.tags.insert(tag.clone(), digest.clone()).as_ref() != Some(digest) {
                    report.tags_updated.push(tag.clone());
                }
            }
            if worklist.pins.contains(digest) {
                record.pinned.insert(digest.clone());
            }
        }

        if let Some(listed) = worklist.listed.as_ref().filter(|_| options.mirror && !cancelled) {
            let absent: Vec<String> = record
                .tags
                .keys()
                .filter(|tag| !listed.contains(*tag))
                .cloned()
                .collect();
            for tag in absent {
                record.tags.remove(&tag);
                report.tags_removed.push(tag);
            }
        }

        record.content = self.catalog.reachable(&record).await?;
        record.updated = chrono::Utc::now();
        report.added = record.content.difference(&before).cloned().collect();
        let removed: BTreeSet<Digest> = before.difference(&record.content).cloned().collect();
        report.removed = removed.clone();

        self.catalog.save_repository(&record).await?;
        tracing::info!(
            tags = record.tags.len(),
            added = report.added.len(),
            removed = removed.len(),
            "reconciled repository"
        );
        Ok(removed)
    }
}

fn merge(mut base: SyncReport, tally: SyncReport) -> SyncReport {
    base.fetched.extend(tally.fetched);
    base.reused.extend(tally.reused);
    base.pending.extend(tally.pending);
    base.failures.extend(tally.failures);
    base
}
