//! Pipeline runs and per-stage results.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifact::VersionedCommit;
use super::error::FailureKind;

/// Whether a stage failure aborts the run or is only logged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailurePolicy {
    #[default]
    Fatal,
    Soft,
}

impl FailurePolicy {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FailurePolicy::Fatal)
    }
}

/// Outcome of a single stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageStatus {
    Ok,
    Failed,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

/// Byte range of the run log holding a stage's captured output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputRef {
    pub log: PathBuf,
    pub start: u64,
    pub end: u64,
}

impl OutputRef {
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Result of one stage. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub policy: FailurePolicy,
    pub duration_ms: u64,

    /// Exit code of the stage process, when one was spawned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    pub output: OutputRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
}

impl StageResult {
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Ok
    }

    /// A failed stage whose policy aborts the run.
    pub fn is_fatal_failure(&self) -> bool {
        !self.passed() && self.policy.is_fatal()
    }
}

/// One end-to-end execution of the stage sequence.
///
/// Only grows by appending stage results and commits; the terminal status is
/// set once by [`PipelineRun::finish_ok`] or [`PipelineRun::finish_aborted`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineRun {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: RunStatus,
    stages: Vec<StageResult>,
    commits: Vec<VersionedCommit>,

    /// State in which the run aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aborted_in: Option<String>,
}

impl PipelineRun {
    /// Start a run; the id is derived from the start timestamp.
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id_for(started_at),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            stages: Vec::new(),
            commits: Vec::new(),
            aborted_in: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn commits(&self) -> &[VersionedCommit] {
        &self.commits
    }

    pub fn aborted_in(&self) -> Option<&str> {
        self.aborted_in.as_deref()
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn push_stage(&mut self, result: StageResult) {
        if self.status == RunStatus::Running {
            self.stages.push(result);
        }
    }

    pub fn push_commit(&mut self, commit: VersionedCommit) {
        if self.status == RunStatus::Running {
            self.commits.push(commit);
        }
    }

    pub fn finish_ok(&mut self) {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Success;
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn finish_aborted(&mut self, state: &str) {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Failed;
            self.aborted_in = Some(state.to_string());
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.passed()).count()
    }

    /// Wall-clock time between start and finish, if finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// `run-20261016T060000Z` for a run started at 2026-10-16 06:00:00 UTC.
pub fn run_id_for(started_at: DateTime<Utc>) -> String {
    format!("run-{}", started_at.format("%Y%m%dT%H%M%SZ"))
}
