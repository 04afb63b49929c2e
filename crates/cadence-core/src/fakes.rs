//! In-memory fakes for the collaborator traits (testing only)
//!
//! `MemoryRevisionTracker` records every call instead of touching git;
//! `MemoryArtifactStore` fingerprints real files but keeps its version
//! history in memory. Both can be told to fail specific operations.
//!
//! A tracker built with [`MemoryRevisionTracker::backed_by`] forwards commits
//! and discards to the store, so a rolled-back version is forgotten the way
//! a discarded pointer file is restored from head.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::artifact_store::ArtifactStore;
use crate::cas::Digest;
use crate::domain::{
    pointer_path_for, ArtifactDescriptor, ArtifactKind, RevisionError, RevisionResult,
    StoreError, StoreResult, VersionPointer,
};
use crate::fingerprint::build_manifest;
use crate::git::{CommitOutcome, RevisionTracker};

// ---------------------------------------------------------------------------
// MemoryRevisionTracker
// ---------------------------------------------------------------------------

/// A commit recorded by [`MemoryRevisionTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCommit {
    pub sha: String,
    pub paths: Vec<PathBuf>,
    pub message: String,
}

#[derive(Debug, Default)]
struct TrackerState {
    syncs: Vec<String>,
    commits: Vec<FakeCommit>,
    /// Number of commits included in each publish.
    publishes: Vec<usize>,
    discarded: Vec<PathBuf>,
    fail_sync: bool,
    fail_commit: bool,
    fail_publish: bool,
}

/// Revision tracker that records calls in memory.
#[derive(Debug, Default)]
pub struct MemoryRevisionTracker {
    state: Mutex<TrackerState>,
    store: Option<Arc<MemoryArtifactStore>>,
}

impl MemoryRevisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle committed pointers in `store` and restore discarded ones.
    pub fn backed_by(mut self, store: Arc<MemoryArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fail_sync(self) -> Self {
        self.state.lock().unwrap().fail_sync = true;
        self
    }

    pub fn fail_commit(self) -> Self {
        self.state.lock().unwrap().fail_commit = true;
        self
    }

    pub fn fail_publish(self) -> Self {
        self.state.lock().unwrap().fail_publish = true;
        self
    }

    pub fn syncs(&self) -> Vec<String> {
        self.state.lock().unwrap().syncs.clone()
    }

    pub fn commits(&self) -> Vec<FakeCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    /// One entry per publish: how many commits existed when it happened.
    pub fn publishes(&self) -> Vec<usize> {
        self.state.lock().unwrap().publishes.clone()
    }

    pub fn discarded(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().discarded.clone()
    }
}

#[async_trait]
impl RevisionTracker for MemoryRevisionTracker {
    async fn sync(&self, branch: &str) -> RevisionResult<()> {
        let mut state = self.state.lock().unwrap();
        state.syncs.push(branch.to_string());
        if state.fail_sync {
            return Err(RevisionError::Sync {
                branch: branch.to_string(),
                reason: "merge conflict".to_string(),
            });
        }
        Ok(())
    }

    async fn stage_and_commit(
        &self,
        paths: &[PathBuf],
        message: &str,
    ) -> RevisionResult<CommitOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commit {
            return Err(RevisionError::Commit("index.lock exists".to_string()));
        }
        if paths.is_empty() {
            return Ok(CommitOutcome::NoOp);
        }
        let sha = format!("{:040x}", state.commits.len() + 1);
        state.commits.push(FakeCommit {
            sha: sha.clone(),
            paths: paths.to_vec(),
            message: message.to_string(),
        });
        drop(state);
        if let Some(store) = &self.store {
            store.settle(paths);
        }
        Ok(CommitOutcome::Committed { sha })
    }

    async fn publish(&self, branch: &str) -> RevisionResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_publish {
            return Err(RevisionError::Publish {
                branch: branch.to_string(),
                reason: "remote rejected".to_string(),
            });
        }
        let count = state.commits.len();
        state.publishes.push(count);
        Ok(())
    }

    async fn discard(&self, paths: &[PathBuf]) -> RevisionResult<()> {
        self.state
            .lock()
            .unwrap()
            .discarded
            .extend(paths.iter().cloned());
        if let Some(store) = &self.store {
            store.restore(paths);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreState {
    /// Distinct versions recorded per artifact name, oldest first.
    versions: HashMap<String, Vec<Digest>>,
    pushed: Vec<(String, Digest)>,
    stale: Vec<PathBuf>,
    /// Uncommitted changes by pointer path: a newly recorded version
    /// (artifact name) or a retired pointer (artifact path).
    recorded: HashMap<PathBuf, String>,
    retired: HashMap<PathBuf, PathBuf>,
    fail_push: bool,
}

/// Artifact store that fingerprints files under `root` and keeps history in memory.
#[derive(Debug)]
pub struct MemoryArtifactStore {
    root: PathBuf,
    state: Mutex<StoreState>,
}

impl MemoryArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn fail_push(self) -> Self {
        self.state.lock().unwrap().fail_push = true;
        self
    }

    /// Let pushes succeed again, e.g. once the remote is back.
    pub fn recover_push(&self) {
        self.state.lock().unwrap().fail_push = false;
    }

    /// Changes behind `pointer_paths` are now committed.
    pub fn settle(&self, pointer_paths: &[PathBuf]) {
        let mut state = self.state.lock().unwrap();
        for path in pointer_paths {
            state.recorded.remove(path);
            state.retired.remove(path);
        }
    }

    /// Undo uncommitted changes behind `pointer_paths`: drop the version
    /// recorded since the last commit and bring back retired pointers.
    pub fn restore(&self, pointer_paths: &[PathBuf]) {
        let mut state = self.state.lock().unwrap();
        for path in pointer_paths {
            if let Some(name) = state.recorded.remove(path) {
                if let Some(history) = state.versions.get_mut(&name) {
                    history.pop();
                }
            }
            if let Some(artifact_path) = state.retired.remove(path) {
                state.stale.push(artifact_path);
            }
        }
    }

    /// Pretend a pointer for `artifact_path` exists, so it can be retired.
    pub fn with_stale_pointer(self, artifact_path: impl Into<PathBuf>) -> Self {
        self.state.lock().unwrap().stale.push(artifact_path.into());
        self
    }

    pub fn versions(&self, name: &str) -> Vec<Digest> {
        self.state
            .lock()
            .unwrap()
            .versions
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn pushed(&self) -> Vec<(String, Digest)> {
        self.state.lock().unwrap().pushed.clone()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn record_version(&self, artifact: &ArtifactDescriptor) -> StoreResult<VersionPointer> {
        let manifest = build_manifest(&self.root.join(&artifact.path), None)?;
        let digest = manifest.digest()?;

        let mut state = self.state.lock().unwrap();
        let history = state.versions.entry(artifact.name.clone()).or_default();
        let previous = history.last().copied();
        if previous != Some(digest) {
            history.push(digest);
            state
                .recorded
                .insert(artifact.pointer_path(), artifact.name.clone());
        }

        Ok(VersionPointer {
            name: artifact.name.clone(),
            path: artifact.path.clone(),
            digest,
            kind: manifest.kind,
            files: manifest.file_count(),
            bytes: manifest.total_bytes(),
            previous,
        })
    }

    async fn diff_against_previous(&self, pointer: &VersionPointer) -> StoreResult<bool> {
        Ok(pointer.is_new_version())
    }

    async fn push(&self, pointer: &VersionPointer) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_push {
            return Err(StoreError::Push {
                name: pointer.name.clone(),
                digest: pointer.digest.short(),
                reason: "remote unreachable".to_string(),
            });
        }
        state.pushed.push((pointer.name.clone(), pointer.digest));
        Ok(())
    }

    async fn retire(&self, stale: &Path) -> StoreResult<Option<PathBuf>> {
        let mut state = self.state.lock().unwrap();
        match state.stale.iter().position(|p| p == stale) {
            Some(idx) => {
                let artifact_path = state.stale.remove(idx);
                let pointer = pointer_path_for(stale);
                state.retired.insert(pointer.clone(), artifact_path);
                Ok(Some(pointer))
            }
            None => Ok(None),
        }
    }
}

impl MemoryArtifactStore {
    /// Build a pointer without touching history, for assertions.
    pub fn peek(&self, artifact: &ArtifactDescriptor) -> StoreResult<(Digest, ArtifactKind)> {
        let manifest = build_manifest(&self.root.join(&artifact.path), None)?;
        Ok((manifest.digest()?, manifest.kind))
    }
}
