//! Cadence Core Library
//!
//! Domain model and collaborator contracts for the scheduled refresh pipeline:
//! the artifact store (content versioning), the revision tracker (source
//! control), content fingerprinting, and tracing setup.

pub mod artifact_store;
pub mod cas;
pub mod domain;
pub mod fakes;
pub mod fingerprint;
pub mod git;
pub mod obs;
pub mod telemetry;

pub use artifact_store::{read_pointer, ArtifactStore, FsArtifactStore};
pub use cas::fs::FsCasStore;
pub use cas::{CasError, CasStore, Digest};

pub use domain::{
    pointer_path_for, run_id_for, ArtifactDescriptor, ArtifactKind, FailureKind, FailurePolicy,
    OutputRef, PipelineRun, RevisionError, RevisionResult, RunStatus, StageFailure, StageResult,
    StageStatus, StoreError, StoreResult, VersionPointer, VersionedCommit,
};

pub use fingerprint::{build_manifest, fingerprint, Manifest, ManifestEntry};
pub use git::{CommitOutcome, GitRevisionTracker, RevisionTracker};

pub use obs::{
    emit_gate_decision, emit_run_aborted, emit_run_finished, emit_run_started,
    emit_stage_finished, emit_stage_started, emit_unpublished_commits, run_span,
};
pub use telemetry::init_tracing;

/// Cadence version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
