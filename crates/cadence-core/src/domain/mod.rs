//! Domain models for Cadence.
//!
//! - `PipelineRun` / `StageResult`: one scheduled execution and its stage outcomes
//! - `ArtifactDescriptor` / `VersionPointer`: content-versioned data and model files
//! - `VersionedCommit`: a revision commit made because artifact content changed

pub mod artifact;
pub mod error;
pub mod run;

pub use artifact::{
    pointer_path_for, ArtifactDescriptor, ArtifactKind, VersionPointer, VersionedCommit,
    POINTER_SUFFIX,
};
pub use error::{FailureKind, RevisionError, RevisionResult, StoreError, StoreResult};
pub use run::{
    run_id_for, FailurePolicy, OutputRef, PipelineRun, RunStatus, StageFailure, StageResult,
    StageStatus,
};
