//! Pipeline controller: an explicit state table driven to `DONE` or
//! `ABORTED`.
//!
//! Each state maps to exactly one step (sync, stage execution, version gate
//! or publish) with a declared failure policy and a next state. A FATAL
//! failure moves straight to `ABORTED`; a SOFT failure is recorded and the
//! run advances.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use cadence_core::{
    emit_run_aborted, emit_run_finished, emit_run_started, emit_stage_finished,
    emit_stage_started, emit_unpublished_commits, run_span, ArtifactStore, FailureKind,
    FailurePolicy, PipelineRun, RevisionTracker, StageFailure, StageResult, StageStatus,
};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::context::RunContext;
use crate::gate::{ArtifactSpec, VersionGate};
use crate::runner::StageExecutor;
use crate::stage::Stage;

/// Controller states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Pulling,
    Ingesting,
    VersioningRaw,
    Monitoring,
    Snapshotting,
    VersioningSnapshot,
    Training,
    Promoting,
    Publishing,
    Done,
    Aborted,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pulling => "PULLING",
            PipelineState::Ingesting => "INGESTING",
            PipelineState::VersioningRaw => "VERSIONING_RAW",
            PipelineState::Monitoring => "MONITORING",
            PipelineState::Snapshotting => "SNAPSHOTTING",
            PipelineState::VersioningSnapshot => "VERSIONING_SNAPSHOT",
            PipelineState::Training => "TRAINING",
            PipelineState::Promoting => "PROMOTING",
            PipelineState::Publishing => "PUBLISHING",
            PipelineState::Done => "DONE",
            PipelineState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Aborted)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single unit of work bound to a state.
#[derive(Debug, Clone)]
pub enum Step {
    Sync,
    Execute(Stage),
    Version(ArtifactSpec),
    Publish,
}

impl Step {
    /// Name recorded in the stage result for this step.
    pub fn result_name(&self) -> String {
        match self {
            Step::Sync => "sync".to_string(),
            Step::Execute(stage) => stage.name.clone(),
            Step::Version(spec) => format!("version:{}", spec.name()),
            Step::Publish => "publish".to_string(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Sync => f.write_str("sync branch"),
            Step::Execute(stage) => write!(f, "run {} ({})", stage.name, stage.invocation.command.join(" ")),
            Step::Version(spec) => write!(f, "version {} ({})", spec.name(), spec.descriptor.path.display()),
            Step::Publish => f.write_str("publish branch"),
        }
    }
}

/// One row of the state table.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: PipelineState,
    pub step: Step,
    pub policy: FailurePolicy,
    pub next: PipelineState,
}

/// The external collaborators of the standard plan.
#[derive(Debug, Clone)]
pub struct StandardStages {
    pub ingest: Stage,
    pub monitor: Stage,
    pub snapshot: Stage,
    pub train: Stage,
    pub promote: Stage,
}

/// Why a state table could not be built.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("stage {stage} must declare exactly one produced artifact, found {found}")]
    ProducedArtifacts { stage: String, found: usize },
}

/// Ordered state table.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    transitions: Vec<Transition>,
}

impl PipelinePlan {
    /// `PULLING -> INGESTING -> VERSIONING_RAW -> MONITORING -> SNAPSHOTTING
    /// -> VERSIONING_SNAPSHOT -> TRAINING -> PROMOTING -> PUBLISHING -> DONE`.
    ///
    /// The two versioning states take the artifact produced by ingestion and
    /// by the snapshot stage respectively.
    pub fn standard(stages: StandardStages) -> Result<Self, PlanError> {
        use PipelineState::*;

        let raw = produced(&stages.ingest)?;
        let training_set = produced(&stages.snapshot)?;

        let row = |state, step: Step, policy, next| Transition {
            state,
            step,
            policy,
            next,
        };
        let stage_row = |state, stage: Stage, next| {
            let policy = stage.policy;
            row(state, Step::Execute(stage), policy, next)
        };

        Ok(Self {
            transitions: vec![
                row(Pulling, Step::Sync, FailurePolicy::Fatal, Ingesting),
                stage_row(Ingesting, stages.ingest, VersioningRaw),
                row(VersioningRaw, Step::Version(raw), FailurePolicy::Fatal, Monitoring),
                stage_row(Monitoring, stages.monitor, Snapshotting),
                stage_row(Snapshotting, stages.snapshot, VersioningSnapshot),
                row(
                    VersioningSnapshot,
                    Step::Version(training_set),
                    FailurePolicy::Fatal,
                    Training,
                ),
                stage_row(Training, stages.train, Promoting),
                stage_row(Promoting, stages.promote, Publishing),
                row(Publishing, Step::Publish, FailurePolicy::Fatal, Done),
            ],
        })
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn initial_state(&self) -> PipelineState {
        self.transitions
            .first()
            .map(|t| t.state)
            .unwrap_or(PipelineState::Done)
    }

    pub fn get(&self, state: PipelineState) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.state == state)
    }

    /// Artifact specs in table order.
    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactSpec> {
        self.transitions.iter().filter_map(|t| match &t.step {
            Step::Version(spec) => Some(spec),
            _ => None,
        })
    }
}

fn produced(stage: &Stage) -> Result<ArtifactSpec, PlanError> {
    match stage.artifacts.as_slice() {
        [spec] => Ok(spec.clone()),
        other => Err(PlanError::ProducedArtifacts {
            stage: stage.name.clone(),
            found: other.len(),
        }),
    }
}

/// Drives a [`PipelinePlan`] to completion.
pub struct PipelineController {
    plan: PipelinePlan,
    gate: VersionGate,
    tracker: Arc<dyn RevisionTracker>,
}

impl PipelineController {
    pub fn new(
        plan: PipelinePlan,
        store: Arc<dyn ArtifactStore>,
        tracker: Arc<dyn RevisionTracker>,
    ) -> Self {
        Self {
            plan,
            gate: VersionGate::new(store, tracker.clone()),
            tracker,
        }
    }

    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    pub fn gate(&self) -> &VersionGate {
        &self.gate
    }

    /// Execute one run. Always returns a finished [`PipelineRun`].
    pub async fn run(&self, ctx: &RunContext) -> PipelineRun {
        self.drive(ctx).instrument(run_span(&ctx.run_id)).await
    }

    async fn drive(&self, ctx: &RunContext) -> PipelineRun {
        let mut run = PipelineRun::new(ctx.started_at);
        emit_run_started(&ctx.run_id, &ctx.branch);
        ctx.log.event(
            "run",
            &format!("starting {} on branch {} in {}", ctx.run_id, ctx.branch, ctx.workdir.display()),
        );

        let mut state = self.plan.initial_state();
        while !state.is_terminal() {
            let Some(transition) = self.plan.get(state) else {
                ctx.log.alert("run", &format!("no transition for state {state}"));
                self.abort(ctx, &mut run, state, "controller", None);
                return run;
            };

            ctx.log.event("run", &format!("state {state}"));
            let result = self.step(transition, ctx, &mut run).await;
            let fatal = result.is_fatal_failure();
            let stage = result.stage.clone();
            let kind = result.failure.as_ref().map(|f| f.kind);
            if !result.passed() && !fatal {
                ctx.log.alert("run", &format!("{stage} FAILED (SOFT); continuing"));
            }
            run.push_stage(result);

            if fatal {
                self.abort(ctx, &mut run, state, &stage, kind);
                return run;
            }
            state = transition.next;
        }

        run.finish_ok();
        let duration_ms = run.duration_ms().unwrap_or(0);
        emit_run_finished(&ctx.run_id, duration_ms, run.stages().len(), run.commits().len());
        ctx.log.event(
            "run",
            &format!(
                "DONE: {} stages ({} failed), {} commit(s), {duration_ms} ms",
                run.stages().len(),
                run.failed_count(),
                run.commits().len()
            ),
        );
        run
    }

    fn abort(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        state: PipelineState,
        stage: &str,
        kind: Option<FailureKind>,
    ) {
        let kind = kind.unwrap_or(FailureKind::StageProcessError);
        emit_run_aborted(&ctx.run_id, state.as_str(), stage, kind);
        ctx.log
            .alert("run", &format!("ABORTED in {state}: {stage} failed with {kind}"));

        if !run.commits().is_empty() {
            let unpublished: Vec<String> = run
                .commits()
                .iter()
                .map(|c| format!("{} {}", c.commit, c.message))
                .collect();
            emit_unpublished_commits(&ctx.run_id, &unpublished);
            ctx.log.alert(
                "run",
                &format!(
                    "{} local commit(s) were NOT published; the next sync rebases them: {}",
                    unpublished.len(),
                    unpublished.join("; ")
                ),
            );
        }
        run.finish_aborted(state.as_str());
    }

    async fn step(
        &self,
        transition: &Transition,
        ctx: &RunContext,
        run: &mut PipelineRun,
    ) -> StageResult {
        let name = transition.step.result_name();
        let policy = transition.policy;
        match &transition.step {
            Step::Execute(stage) => StageExecutor::run(stage, ctx).await,
            Step::Sync => {
                record(&name, policy, ctx, async {
                    self.tracker.sync(&ctx.branch).await.map_err(|e| failure(e.kind(), &e))
                })
                .await
            }
            Step::Version(spec) => {
                let mut committed = None;
                let result = record(&name, policy, ctx, async {
                    let outcome = self
                        .gate
                        .maybe_version_and_commit(spec, ctx)
                        .await
                        .map_err(|e| failure(e.kind(), &e))?;
                    committed = outcome.commit().cloned();
                    Ok::<(), StageFailure>(())
                })
                .await;
                if let Some(commit) = committed {
                    run.push_commit(commit);
                }
                result
            }
            Step::Publish => {
                let pending = run.commits().len();
                record(&name, policy, ctx, async {
                    ctx.log.event(
                        &name,
                        &format!("publishing {pending} commit(s) to {}", ctx.branch),
                    );
                    self.tracker.publish(&ctx.branch).await.map_err(|e| failure(e.kind(), &e))
                })
                .await
            }
        }
    }
}

fn failure(kind: FailureKind, err: &dyn fmt::Display) -> StageFailure {
    StageFailure {
        kind,
        message: err.to_string(),
    }
}

/// Wrap an in-process step with the same markers and result shape as a
/// subprocess stage.
async fn record<F>(name: &str, policy: FailurePolicy, ctx: &RunContext, work: F) -> StageResult
where
    F: Future<Output = Result<(), StageFailure>>,
{
    let start = Instant::now();
    let offset = ctx.log.offset();
    emit_stage_started(name);
    ctx.log.stage_start(name);

    let outcome = work.await;
    let duration_ms = start.elapsed().as_millis() as u64;
    let (status, failure) = match outcome {
        Ok(()) => (StageStatus::Ok, None),
        Err(failure) => {
            let label = if policy.is_fatal() { "FATAL" } else { "SOFT" };
            ctx.log
                .alert(name, &format!("{} ({label}): {}", failure.kind, failure.message));
            (StageStatus::Failed, Some(failure))
        }
    };

    let output = ctx.log.since(offset);
    ctx.log.stage_end(name, status, duration_ms);
    emit_stage_finished(name, status, duration_ms);

    StageResult {
        stage: name.to_string(),
        status,
        policy,
        duration_ms,
        exit_code: None,
        output,
        failure,
    }
}
