//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span via [`run_span`]
//! - Emission functions for key lifecycle events: run start/finish/abort,
//!   stage start/finish, version gate decisions
//!
//! Events are emitted at `info!` level, or `warn!`/`error!` for failures.
//! For JSON output, pass `--json` to the binary.

use tracing::{error, info, warn, Span};

use crate::domain::{FailureKind, StageStatus};

/// Run-scoped tracing span.
///
/// Attach it to the run's future with `tracing::Instrument` so every event
/// emitted while the run is in flight carries the run id.
///
/// # Example
///
/// ```ignore
/// run_pipeline(ctx).instrument(run_span("run-20261016T060000Z")).await;
/// ```
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("cadence.run", run_id = %run_id)
}

/// Emit event: run started on a branch.
pub fn emit_run_started(run_id: &str, branch: &str) {
    info!(event = "run.started", run_id = %run_id, branch = %branch);
}

/// Emit event: run reached DONE.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, stages: usize, commits: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        stages = stages,
        commits = commits,
    );
}

/// Emit event: run transitioned to ABORTED.
pub fn emit_run_aborted(run_id: &str, state: &str, stage: &str, kind: FailureKind) {
    error!(
        event = "run.aborted",
        run_id = %run_id,
        state = %state,
        stage = %stage,
        kind = %kind,
    );
}

/// Emit event: stage started.
pub fn emit_stage_started(stage: &str) {
    info!(event = "stage.started", stage = %stage);
}

/// Emit event: stage finished with status and duration.
pub fn emit_stage_finished(stage: &str, status: StageStatus, duration_ms: u64) {
    match status {
        StageStatus::Ok => info!(
            event = "stage.finished",
            stage = %stage,
            status = "OK",
            duration_ms = duration_ms,
        ),
        StageStatus::Failed => warn!(
            event = "stage.finished",
            stage = %stage,
            status = "FAILED",
            duration_ms = duration_ms,
        ),
    }
}

/// Emit event: version gate decided whether an artifact changed.
pub fn emit_gate_decision(artifact: &str, digest: &str, changed: bool) {
    info!(
        event = "gate.decision",
        artifact = %artifact,
        digest = %digest,
        changed = changed,
    );
}

/// Emit event: the run ends with local commits that were never published.
pub fn emit_unpublished_commits(run_id: &str, commits: &[String]) {
    error!(
        event = "run.unpublished_commits",
        run_id = %run_id,
        count = commits.len(),
        commits = ?commits,
    );
}
