//! Error taxonomy for the pipeline's collaborators.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cas::CasError;

/// Classification used when logging and recording a failed step.
///
/// Every failure surfaced by a pipeline step maps to exactly one kind; the
/// kind is what appears in the run log and the run report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FailureKind {
    SyncError,
    PublishError,
    CommitError,
    StorePushError,
    StoreError,
    PreconditionError,
    PostconditionError,
    StageProcessError,
    StageTimeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SyncError => "SyncError",
            FailureKind::PublishError => "PublishError",
            FailureKind::CommitError => "CommitError",
            FailureKind::StorePushError => "StorePushError",
            FailureKind::StoreError => "StoreError",
            FailureKind::PreconditionError => "PreconditionError",
            FailureKind::PostconditionError => "PostconditionError",
            FailureKind::StageProcessError => "StageProcessError",
            FailureKind::StageTimeout => "StageTimeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the revision tracker (source control).
#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    #[error("sync of branch {branch} failed: {reason}")]
    Sync { branch: String, reason: String },

    #[error("publish of branch {branch} failed: {reason}")]
    Publish { branch: String, reason: String },

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("discard of uncommitted paths failed: {0}")]
    Discard(String),

    #[error("git error: {0}")]
    Git(String),
}

impl RevisionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RevisionError::Sync { .. } => FailureKind::SyncError,
            RevisionError::Publish { .. } => FailureKind::PublishError,
            RevisionError::Commit(_) | RevisionError::Discard(_) | RevisionError::Git(_) => {
                FailureKind::CommitError
            }
        }
    }
}

/// Errors from the artifact store (content versioning).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    MissingArtifact(PathBuf),

    #[error("invalid version pointer {path}: {reason}")]
    Pointer { path: PathBuf, reason: String },

    #[error("push of {name}@{digest} failed: {reason}")]
    Push {
        name: String,
        digest: String,
        reason: String,
    },

    #[error("cas error: {0}")]
    Cas(#[from] CasError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Push { .. } => FailureKind::StorePushError,
            _ => FailureKind::StoreError,
        }
    }
}

/// Result type for artifact store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for revision tracker operations.
pub type RevisionResult<T> = std::result::Result<T, RevisionError>;
