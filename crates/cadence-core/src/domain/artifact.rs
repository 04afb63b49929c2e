//! Versioned artifacts and the commits that record them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cas::Digest;

/// Suffix appended to an artifact path to form its version pointer file.
pub const POINTER_SUFFIX: &str = ".ptr";

/// A file or directory whose content history is tracked by the artifact store.
///
/// The fingerprint of the last versioned state is not held here; it lives in
/// the store's own metadata (the pointer file).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    /// Logical name (e.g. `raw`, `training_set`).
    pub name: String,

    /// Path relative to the working copy root.
    pub path: PathBuf,

    /// Path of an older representation whose pointer is retired when this
    /// artifact is next versioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retires: Option<PathBuf>,
}

impl ArtifactDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            retires: None,
        }
    }

    /// Retire the pointer of `stale` in the same commit as this artifact.
    pub fn retiring(mut self, stale: impl Into<PathBuf>) -> Self {
        self.retires = Some(stale.into());
        self
    }

    /// Relative path of this artifact's pointer file.
    pub fn pointer_path(&self) -> PathBuf {
        pointer_path_for(&self.path)
    }
}

/// Pointer file path for an artifact path (`data/raw` -> `data/raw.ptr`).
pub fn pointer_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(POINTER_SUFFIX);
    PathBuf::from(os)
}

/// Shape of a versioned artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Directory,
}

/// A recorded version of an artifact.
///
/// This is what the pointer file contains. `previous` is the digest the
/// pointer held before this recording and is not persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionPointer {
    pub name: String,
    pub path: PathBuf,
    pub digest: Digest,
    pub kind: ArtifactKind,
    pub files: u64,
    pub bytes: u64,

    #[serde(skip)]
    pub previous: Option<Digest>,
}

impl VersionPointer {
    /// Whether this recording differs from the prior recorded version.
    pub fn is_new_version(&self) -> bool {
        self.previous.as_ref() != Some(&self.digest)
    }
}

/// A commit made by the version gate for a changed artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionedCommit {
    pub artifact: String,
    pub digest: Digest,
    pub commit: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,

    /// Stale pointer removed in the same commit, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired: Option<PathBuf>,
}
