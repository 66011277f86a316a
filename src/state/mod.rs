//! Reconciliation state store
//!
//! Durable record of what has been applied, its last-observed status, and
//! the content hash of the rendering that produced it. The orchestrator
//! consults the store to skip already-converged resources (idempotence)
//! and to compute upgrade deltas when the catalog version changes;
//! records persist across runs and are removed only on explicit
//! uninstall.
//!
//! Every `put` supersedes the prior record for the same key, and the file
//! store persists via write-then-rename so a reader never observes a torn
//! snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::graph::{Readiness, ResourceKey};

/// Lifecycle phase of a resource, tracked across orchestrator runs.
///
/// Normal path: `Unknown -> Planned -> Applying -> (Established|Ready) ->
/// Converged`. Error branch: `Applying -> Failed` (retried on the next
/// run). Removal branch: `Deleting -> Absent`.
///
/// A new run writes `Applying` directly over whatever phase the previous
/// run left behind: `Converged` on hash drift, `Failed` on retry,
/// `Applying`/`Established` after a readiness timeout. Teardown may begin
/// from any live phase, not only `Converged`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourcePhase {
    /// Never seen by the orchestrator
    Unknown,
    /// Selected into a plan but not yet applied this run
    Planned,
    /// Apply issued, awaiting acknowledgment or readiness
    Applying,
    /// Cluster reports the Established condition (CRDs)
    Established,
    /// Cluster reports Ready/Available (workloads)
    Ready,
    /// Readiness satisfied and content hash matches the catalog rendering
    Converged,
    /// Terminal for the current run; eligible for retry next run
    Failed,
    /// Deletion issued, awaiting removal
    Deleting,
    /// Confirmed removed from the cluster
    Absent,
}

impl ResourcePhase {
    /// Whether this observed phase satisfies a dependency requirement.
    pub fn satisfies(&self, requirement: Readiness) -> bool {
        match requirement {
            Readiness::Exists => matches!(
                self,
                ResourcePhase::Established | ResourcePhase::Ready | ResourcePhase::Converged
            ),
            Readiness::Established => matches!(
                self,
                ResourcePhase::Established | ResourcePhase::Ready | ResourcePhase::Converged
            ),
            Readiness::Ready => matches!(self, ResourcePhase::Ready | ResourcePhase::Converged),
            Readiness::Deleted => matches!(self, ResourcePhase::Absent),
        }
    }

    /// Whether the state machine permits moving to `next`.
    ///
    /// Identity transitions are always permitted.
    pub fn can_transition_to(&self, next: ResourcePhase) -> bool {
        use ResourcePhase::*;
        if *self == next {
            return true;
        }
        match next {
            Unknown => false,
            Planned => matches!(*self, Unknown | Failed | Converged | Absent),
            // Any phase a prior run can leave behind is a valid starting
            // point for a fresh apply.
            Applying => matches!(
                *self,
                Unknown | Planned | Established | Ready | Converged | Failed
            ),
            Established => matches!(*self, Applying),
            Ready => matches!(*self, Applying | Established),
            Converged => matches!(*self, Applying | Established | Ready),
            Failed => matches!(*self, Applying | Deleting),
            // Teardown can start from any live phase
            Deleting => !matches!(*self, Absent),
            Absent => matches!(*self, Deleting),
        }
    }
}

/// Last-known outcome of applying a resource to the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedResource {
    /// Identity of the resource
    pub key: ResourceKey,
    /// Generation observed on the live object, when known
    pub generation: Option<i64>,
    /// Last-observed lifecycle phase
    pub observed_phase: ResourcePhase,
    /// SHA-256 of the rendered document that was applied
    pub last_applied_hash: String,
    /// When the phase last changed
    pub last_transition_time: DateTime<Utc>,
}

impl AppliedResource {
    /// Create a record with the current time as transition time
    pub fn new(key: ResourceKey, phase: ResourcePhase, hash: impl Into<String>) -> Self {
        Self {
            key,
            generation: None,
            observed_phase: phase,
            last_applied_hash: hash.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Return a copy advanced to `phase`, stamping the transition time
    pub fn with_phase(&self, phase: ResourcePhase) -> Self {
        Self {
            observed_phase: phase,
            last_transition_time: Utc::now(),
            ..self.clone()
        }
    }
}

/// Errors from state store operations
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading or writing the backing file failed
    #[error("state store io error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing snapshot could not be (de)serialized
    #[error("state store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable per-resource state, shared across concurrent apply workers.
///
/// `put` supersedes the prior record for the same key; `get` always
/// returns the latest known state. Reads and writes to a given key are
/// serialized; different keys may proceed concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Latest record for a key, or `None` if never applied
    async fn get(&self, key: &ResourceKey) -> Result<Option<AppliedResource>, StateError>;

    /// Record the latest state for a resource, superseding any prior record
    async fn put(&self, record: AppliedResource) -> Result<(), StateError>;

    /// Remove the record for a key (explicit uninstall only)
    async fn delete(&self, key: &ResourceKey) -> Result<(), StateError>;

    /// All records, ordered by key
    async fn list(&self) -> Result<Vec<AppliedResource>, StateError>;
}

/// In-memory store for tests and single-run orchestrations.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: DashMap<ResourceKey, AppliedResource>,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<AppliedResource>, StateError> {
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    async fn put(&self, record: AppliedResource) -> Result<(), StateError> {
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), StateError> {
        self.records.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AppliedResource>, StateError> {
        let mut all: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }
}

/// File-backed store: a JSON snapshot rewritten atomically on every
/// mutation (write temp file, then rename), so a crash mid-run leaves a
/// consistent, resumable record.
pub struct FileStateStore {
    path: PathBuf,
    records: Mutex<BTreeMap<ResourceKey, AppliedResource>>,
}

impl FileStateStore {
    /// Open a store at `path`, loading any existing snapshot.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<AppliedResource> = serde_json::from_slice(&bytes)?;
                debug!(path = %path.display(), records = list.len(), "loaded state snapshot");
                list.into_iter().map(|r| (r.key.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn persist(&self, records: &BTreeMap<ResourceKey, AppliedResource>) -> Result<(), StateError> {
        let list: Vec<&AppliedResource> = records.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<AppliedResource>, StateError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn put(&self, record: AppliedResource) -> Result<(), StateError> {
        let mut records = self.records.lock().await;
        records.insert(record.key.clone(), record);
        self.persist(&records).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), StateError> {
        let mut records = self.records.lock().await;
        records.remove(key);
        self.persist(&records).await
    }

    async fn list(&self) -> Result<Vec<AppliedResource>, StateError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

/// Keys whose stored hash differs from a fresh rendering (or that have
/// no record at all). This is the upgrade-delta set: on a catalog version
/// bump only these resources need re-apply.
pub async fn changed_keys(
    store: &dyn StateStore,
    rendered: &[(ResourceKey, String)],
) -> Result<Vec<ResourceKey>, StateError> {
    let mut changed = Vec::new();
    for (key, hash) in rendered {
        match store.get(key).await? {
            Some(record)
                if record.last_applied_hash == *hash
                    && record.observed_phase == ResourcePhase::Converged => {}
            _ => changed.push(key.clone()),
        }
    }
    Ok(changed)
}
