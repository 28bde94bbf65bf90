//! Sync run records: state machine, outcome report and progress snapshots.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::Digest;
use crate::error::{ErrorKind, Failure, RegistryError};
use crate::filter::Filter;

/// Where a sync run is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    /// Created, not started.
    Pending,

    /// Expanding selectors into a worklist.
    Resolving,

    /// Fetching and committing the worklist.
    Fetching,

    /// Updating tags and removing unreferenced content.
    Reconciling,

    /// Finished, possibly with item failures in the report.
    Completed,

    /// Finished without a consistent tag set.
    Failed,
}

impl SyncState {
    /// Whether the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::Completed | SyncState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        match (self, next) {
            (Pending, Resolving)
            | (Resolving, Fetching)
            | (Fetching, Reconciling)
            | (Reconciling, Completed) => true,
            (state, Failed) => !state.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Pending => "pending",
            SyncState::Resolving => "resolving",
            SyncState::Fetching => "fetching",
            SyncState::Reconciling => "reconciling",
            SyncState::Completed => "completed",
            SyncState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One worklist item which could not be synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// The tag or digest that was being synced.
    pub item: String,

    /// The manifest digest, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,

    /// Error classification.
    pub kind: ErrorKind,

    /// Error detail.
    pub message: String,
}

impl FailedItem {
    /// Record `error` against `item`.
    pub fn new(item: impl Into<String>, digest: Option<Digest>, error: &RegistryError) -> Self {
        let failure = Failure::from(error);
        FailedItem {
            item: item.into(),
            digest,
            kind: failure.kind,
            message: failure.message,
        }
    }
}

/// What a sync run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Tags created or repointed.
    pub tags_updated: Vec<String>,

    /// Tags removed because the upstream no longer has them.
    pub tags_removed: Vec<String>,

    /// Digests the repository now holds that it did not before.
    pub added: BTreeSet<Digest>,

    /// Digests the repository no longer holds.
    pub removed: BTreeSet<Digest>,

    /// Digests physically deleted because no repository holds them.
    pub deleted: BTreeSet<Digest>,

    /// Manifests and blobs downloaded from the upstream.
    pub fetched: BTreeSet<Digest>,

    /// Manifests and blobs already stored.
    pub reused: BTreeSet<Digest>,

    /// Layers left for on-demand download.
    pub pending: BTreeSet<Digest>,

    /// Items which failed. Siblings were still synced.
    pub failures: Vec<FailedItem>,
}

/// A snapshot of a running sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Current state.
    pub state: Option<SyncState>,

    /// Worklist items.
    pub total: usize,

    /// Items finished, successfully or not.
    pub done: usize,

    /// Items which failed.
    pub failed: usize,
}

/// A requested transition the state machine does not allow.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("sync run cannot move from {from} to {to}")]
pub struct IllegalTransition {
    /// Current state.
    pub from: SyncState,

    /// Requested state.
    pub to: SyncState,
}

impl From<IllegalTransition> for RegistryError {
    fn from(error: IllegalTransition) -> Self {
        RegistryError::Failed(Failure::new(ErrorKind::Invalid, error.to_string()))
    }
}

/// One execution of the sync pipeline for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    /// Run identifier.
    pub id: Uuid,

    /// Local repository.
    pub repository: String,

    /// The upstream this run pulled from.
    pub upstream: String,

    /// Tag selectors.
    pub tags: Filter,

    /// Digest selectors.
    #[serde(default)]
    pub digests: Vec<Digest>,

    /// Current state.
    pub state: SyncState,

    /// When the run was created.
    pub started: DateTime<Utc>,

    /// When the run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,

    /// The outcome.
    #[serde(default)]
    pub report: SyncReport,

    /// Why the run failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl SyncRun {
    /// A pending run.
    pub fn new(
        repository: impl Into<String>,
        upstream: impl Into<String>,
        tags: Filter,
        digests: Vec<Digest>,
    ) -> Self {
        SyncRun {
            id: Uuid::new_v4(),
            repository: repository.into(),
            upstream: upstream.into(),
            tags,
            digests,
            state: SyncState::Pending,
            started: Utc::now(),
            finished: None,
            report: SyncReport::default(),
            error: None,
        }
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    pub fn advance(&mut self, next: SyncState) -> Result<(), IllegalTransition> {
        if !self.state.can_advance_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(run = %self.id, from = %self.state, to = %next, "sync run transition");
        self.state = next;
        if next.is_terminal() {
            self.finished = Some(Utc::now());
        }
        Ok(())
    }

    /// Finish as failed.
    pub fn fail(&mut self, failure: Failure) -> Result<(), IllegalTransition> {
        self.advance(SyncState::Failed)?;
        self.error = Some(failure);
        Ok(())
    }
}
