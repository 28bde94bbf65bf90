//! The content graph: manifest records, repositories, and sync run history.
//!
//! Manifests and blobs live in the [`ContentStore`]; this module keeps the index over them.
//! A [`ManifestRecord`] lists what a stored manifest references, and a [`RepositoryRecord`]
//! holds tags, pinned digests and the set of every digest the repository currently holds.
//! Garbage collection is a re-scan of those sets, never a refcount.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use storage::StorageBucket;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};

use crate::content::ContentStore;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{Manifest, MediaType};
use crate::sync::SyncRun;

/// What the graph knows about one stored manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// The manifest digest.
    pub digest: Digest,

    /// The manifest schema.
    pub media_type: MediaType,

    /// Size of the stored bytes.
    pub size: u64,

    /// The config blob, for images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Digest>,

    /// Layer blobs, base first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<Digest>,

    /// Platform manifests, for lists.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<Digest>,

    /// Layers which are not distributed through the registry.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub foreign: BTreeSet<Digest>,
}

impl ManifestRecord {
    /// Every digest this record points at.
    pub fn references(&self) -> impl Iterator<Item = &Digest> {
        self.config
            .iter()
            .chain(self.layers.iter())
            .chain(self.manifests.iter())
    }
}

impl From<&Manifest> for ManifestRecord {
    fn from(manifest: &Manifest) -> Self {
        ManifestRecord {
            digest: manifest.digest.clone(),
            media_type: manifest.media_type,
            size: manifest.bytes.len() as u64,
            config: manifest.config().cloned(),
            layers: manifest.layers().iter().map(|l| l.digest.clone()).collect(),
            manifests: manifest.children().map(|c| c.digest.clone()).collect(),
            foreign: manifest
                .layers()
                .iter()
                .filter(|l| l.foreign)
                .map(|l| l.digest.clone())
                .collect(),
        }
    }
}

/// A repository: tags, pinned digests, and everything reachable from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// Repository name.
    pub name: String,

    /// Tag name to manifest digest.
    #[serde(default)]
    pub tags: BTreeMap<String, Digest>,

    /// Manifests held by digest rather than through a tag.
    #[serde(default)]
    pub pinned: BTreeSet<Digest>,

    /// Every digest the repository holds.
    #[serde(default)]
    pub content: BTreeSet<Digest>,

    /// Last modification.
    pub updated: DateTime<Utc>,
}

impl RepositoryRecord {
    /// An empty repository.
    pub fn new(name: impl Into<String>) -> Self {
        RepositoryRecord {
            name: name.into(),
            tags: BTreeMap::new(),
            pinned: BTreeSet::new(),
            content: BTreeSet::new(),
            updated: Utc::now(),
        }
    }

    /// Whether `digest` belongs to this repository.
    pub fn holds(&self, digest: &Digest) -> bool {
        self.content.contains(digest)
    }

    fn roots(&self) -> impl Iterator<Item = &Digest> {
        self.tags.values().chain(self.pinned.iter())
    }
}

/// Index over the content store.
#[derive(Debug, Clone)]
pub struct Catalog {
    bucket: StorageBucket,
    content: ContentStore,
    sweep: Arc<RwLock<()>>,
    sweeps: Arc<AtomicU64>,
    repositories: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// How often a fetch is retried when a sweep removes its content before it is attached.
pub(crate) const COMMIT_ATTEMPTS: usize = 3;

impl Catalog {
    /// Build a catalog whose records and content share `bucket`.
    pub fn new(bucket: StorageBucket, algorithms: crate::digest::AllowedAlgorithms) -> Self {
        Catalog {
            content: ContentStore::new(bucket.clone(), algorithms),
            bucket,
            sweep: Default::default(),
            sweeps: Default::default(),
            repositories: Default::default(),
        }
    }

    /// The content store.
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    fn record_path(digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("records/{}/{}.json", digest.algorithm(), digest.hex()))
    }

    fn repository_path(name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("repositories/{name}/repository.json"))
    }

    fn run_path(repository: &str, run: &uuid::Uuid) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("runs/{repository}/{run}.json"))
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Utf8PathBuf) -> RegistryResult<Option<T>> {
        match self.bucket.get(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Utf8PathBuf, value: &T) -> RegistryResult<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.bucket.put(path, &data).await?;
        Ok(())
    }

    /// Serialize read-modify-write of one repository record.
    pub async fn lock_repository(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .repositories
            .entry(name.to_owned())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Hold off deletion sweeps while content is attached to a repository.
    ///
    /// Content is fetched and stored without the guard, so a sweep may remove it before it is
    /// attached. Note [`Catalog::sweeps`] before fetching and check [`Catalog::intact`] under
    /// the guard when it moved.
    pub async fn commit_guard(&self) -> OwnedRwLockReadGuard<()> {
        self.sweep.clone().read_owned().await
    }

    /// Number of sweeps which deleted anything. Stable while a commit guard is held.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Acquire)
    }

    /// Whether a committed manifest still has its record and bytes, as do the manifests below
    /// it. Blobs are checked only where `stored` says they were stored.
    pub async fn intact(
        &self,
        root: &Digest,
        stored: impl Fn(&Digest) -> bool,
    ) -> RegistryResult<bool> {
        let mut seen = BTreeSet::new();
        let mut pending = vec![root.clone()];
        while let Some(digest) = pending.pop() {
            if !seen.insert(digest.clone()) {
                continue;
            }
            let Some(record) = self.record(&digest).await? else {
                return Ok(false);
            };
            if !self.content.exists(&digest).await? {
                return Ok(false);
            }
            for blob in record.config.iter().chain(&record.layers) {
                if stored(blob) && !self.content.exists(blob).await? {
                    return Ok(false);
                }
            }
            pending.extend(record.manifests);
        }
        Ok(true)
    }

    /// Look up the record for a stored manifest.
    pub async fn record(&self, digest: &Digest) -> RegistryResult<Option<ManifestRecord>> {
        self.read_json(&Self::record_path(digest)).await
    }

    /// Store manifest bytes and their record.
    ///
    /// A list is only committed once every platform manifest it references has a record, so
    /// no stored list ever has a dangling entry.
    #[tracing::instrument(skip(self, manifest), fields(digest = %manifest.digest, media_type = %manifest.media_type))]
    pub async fn commit_manifest(&self, manifest: &Manifest) -> RegistryResult<ManifestRecord> {
        let mut missing = Vec::new();
        for child in manifest.children() {
            if self.record(&child.digest).await?.is_none() {
                missing.push(child.digest.to_string());
            }
        }
        if !missing.is_empty() {
            return Err(RegistryError::InconsistentGraph(format!(
                "{} references unresolved manifests: {}",
                manifest.digest,
                missing.join(", ")
            )));
        }

        self.content
            .put_manifest(&manifest.digest, &manifest.bytes)
            .await?;
        let record = ManifestRecord::from(manifest);
        self.write_json(&Self::record_path(&manifest.digest), &record)
            .await?;
        Ok(record)
    }

    /// Read and parse a stored manifest.
    pub async fn manifest(&self, digest: &Digest) -> RegistryResult<(ManifestRecord, bytes::Bytes)> {
        let record = self
            .record(digest)
            .await?
            .ok_or_else(|| RegistryError::ManifestNotFound(digest.to_string()))?;
        let data = self.content.get(digest).await.map_err(|error| {
            if error.is_not_found() {
                RegistryError::ManifestNotFound(digest.to_string())
            } else {
                error
            }
        })?;
        Ok((record, data))
    }

    /// Load a repository record.
    pub async fn repository(&self, name: &str) -> RegistryResult<Option<RepositoryRecord>> {
        self.read_json(&Self::repository_path(name)).await
    }

    /// Persist a repository record. Callers hold [`Catalog::lock_repository`].
    pub async fn save_repository(&self, record: &RepositoryRecord) -> RegistryResult<()> {
        self.write_json(&Self::repository_path(&record.name), record)
            .await
    }

    /// All repository names.
    pub async fn repositories(&self) -> RegistryResult<Vec<String>> {
        let keys = self
            .bucket
            .list(Some(camino::Utf8Path::new("repositories")))
            .await?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                key.strip_prefix("repositories/")?
                    .strip_suffix("/repository.json")
                    .map(str::to_owned)
            })
            .collect())
    }

    /// The digests reachable from a repository's tags and pins.
    ///
    /// Blobs have no record and end the walk; manifests without a record are kept as
    /// reachable but contribute nothing further.
    pub async fn reachable(&self, record: &RepositoryRecord) -> RegistryResult<BTreeSet<Digest>> {
        let mut reached = BTreeSet::new();
        let mut pending: Vec<Digest> = record.roots().cloned().collect();
        while let Some(digest) = pending.pop() {
            if !reached.insert(digest.clone()) {
                continue;
            }
            if let Some(manifest) = self.record(&digest).await? {
                pending.extend(manifest.references().cloned());
            }
        }
        Ok(reached)
    }

    /// Delete `digest` if no repository holds it. Returns whether it was deleted.
    pub async fn delete_if_unreferenced(&self, digest: &Digest) -> RegistryResult<bool> {
        let deleted = self.delete_unreferenced([digest.clone()]).await?;
        Ok(!deleted.is_empty())
    }

    /// Delete every candidate no repository holds, returning those deleted.
    ///
    /// Runs under the sweep lock, so nothing is removed while a commit guard is held.
    #[tracing::instrument(skip_all)]
    pub async fn delete_unreferenced(
        &self,
        candidates: impl IntoIterator<Item = Digest>,
    ) -> RegistryResult<BTreeSet<Digest>> {
        let candidates: BTreeSet<Digest> = candidates.into_iter().collect();
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }

        let _sweep = self.sweep.write().await;

        let mut held = BTreeSet::new();
        for name in self.repositories().await? {
            if let Some(repository) = self.repository(&name).await? {
                held.extend(
                    repository
                        .content
                        .into_iter()
                        .filter(|digest| candidates.contains(digest)),
                );
            }
        }

        let doomed: Vec<&Digest> = candidates.difference(&held).collect();
        if !doomed.is_empty() {
            self.sweeps.fetch_add(1, Ordering::AcqRel);
        }

        let mut deleted = BTreeSet::new();
        for digest in doomed {
            self.content.delete(digest).await?;
            self.bucket.delete(&Self::record_path(digest)).await?;
            deleted.insert(digest.clone());
        }

        if !deleted.is_empty() {
            tracing::info!(count = deleted.len(), "deleted unreferenced content");
        }
        Ok(deleted)
    }

    /// Delete stored content that no repository holds at all.
    pub async fn collect_garbage(&self) -> RegistryResult<BTreeSet<Digest>> {
        let stored = self.content.list().await?;
        self.delete_unreferenced(stored).await
    }

    /// Persist a sync run.
    pub async fn save_run(&self, run: &SyncRun) -> RegistryResult<()> {
        self.write_json(&Self::run_path(&run.repository, &run.id), run)
            .await
    }

    /// Sync history for a repository, oldest first.
    pub async fn runs(&self, repository: &str) -> RegistryResult<Vec<SyncRun>> {
        let prefix = Utf8PathBuf::from(format!("runs/{repository}"));
        let mut runs = Vec::new();
        for key in self.bucket.list(Some(&prefix)).await? {
            let path = Utf8PathBuf::from(key);
            // Nested repository names share the prefix.
            if path.parent() != Some(prefix.as_path()) {
                continue;
            }
            if let Some(run) = self.read_json::<SyncRun>(&path).await? {
                runs.push(run);
            }
        }
        runs.sort_by_key(|run| run.started);
        Ok(runs)
    }
}
