//! Stage execution.
//!
//! [`StageExecutor::run`] checks the precondition, spawns the stage's
//! command in the working copy, streams its stdout and stderr line by line
//! into the run log, enforces the optional timeout and finally checks the
//! postcondition. Start and end markers are written for every stage,
//! whatever the outcome.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use cadence_core::{
    emit_stage_finished, emit_stage_started, FailureKind, StageFailure, StageResult, StageStatus,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::context::{RunContext, RunLog};
use crate::stage::Stage;

/// Environment variable carrying the run id into every stage.
pub const RUN_ID_ENV: &str = "CADENCE_RUN_ID";

/// Environment variable carrying the run date (`%Y-%m-%d`) into every stage.
pub const RUN_DATE_ENV: &str = "CADENCE_RUN_DATE";

/// How long output is still copied once the stage process has exited.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Why a stage failed.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("postcondition failed: {0}")]
    Postcondition(String),

    #[error("process failed with {status}")]
    Process { status: String },

    #[error("could not run {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("timed out after {0} seconds")]
    Timeout(u64),
}

impl StageError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::Precondition(_) => FailureKind::PreconditionError,
            StageError::Postcondition(_) => FailureKind::PostconditionError,
            StageError::Process { .. } | StageError::Spawn { .. } => FailureKind::StageProcessError,
            StageError::Timeout(_) => FailureKind::StageTimeout,
        }
    }
}

/// Runs one stage and classifies its outcome.
pub struct StageExecutor;

impl StageExecutor {
    /// Execute `stage` and return its result. Never fails: every problem is
    /// folded into a FAILED [`StageResult`] carrying the failure kind.
    pub async fn run(stage: &Stage, ctx: &RunContext) -> StageResult {
        let start = Instant::now();
        let offset = ctx.log.offset();
        emit_stage_started(&stage.name);
        ctx.log.stage_start(&stage.name);

        let mut exit_code = None;
        let outcome = Self::execute(stage, ctx, &mut exit_code).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (status, failure) = match outcome {
            Ok(()) => (StageStatus::Ok, None),
            Err(err) => {
                let output = ctx.log.since(offset);
                ctx.log.alert(
                    &stage.name,
                    &format!(
                        "{} ({}): {err} [output: {} bytes {}..{}]",
                        err.kind(),
                        policy_label(stage),
                        output.log.display(),
                        output.start,
                        output.end,
                    ),
                );
                let failure = StageFailure {
                    kind: err.kind(),
                    message: err.to_string(),
                };
                (StageStatus::Failed, Some(failure))
            }
        };

        let output = ctx.log.since(offset);
        ctx.log.stage_end(&stage.name, status, duration_ms);
        emit_stage_finished(&stage.name, status, duration_ms);

        StageResult {
            stage: stage.name.clone(),
            status,
            policy: stage.policy,
            duration_ms,
            exit_code,
            output,
            failure,
        }
    }

    async fn execute(
        stage: &Stage,
        ctx: &RunContext,
        exit_code: &mut Option<i32>,
    ) -> Result<(), StageError> {
        if let Some(condition) = &stage.precondition {
            condition
                .check(&ctx.workdir)
                .map_err(StageError::Precondition)?;
        }

        let status = Self::spawn_and_wait(stage, ctx).await?;
        *exit_code = status.code();
        if !status.success() {
            return Err(StageError::Process {
                status: status.to_string(),
            });
        }

        if let Some(condition) = &stage.postcondition {
            condition
                .check(&ctx.workdir)
                .map_err(StageError::Postcondition)?;
        }
        Ok(())
    }

    async fn spawn_and_wait(stage: &Stage, ctx: &RunContext) -> Result<ExitStatus, StageError> {
        let invocation = &stage.invocation;
        let (program, args) =
            invocation
                .command
                .split_first()
                .ok_or_else(|| StageError::Spawn {
                    program: stage.name.clone(),
                    reason: "empty command".to_string(),
                })?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&ctx.workdir)
            .envs(&invocation.env)
            .env(RUN_ID_ENV, &ctx.run_id)
            .env(RUN_DATE_ENV, ctx.run_date())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let output = async {
            tokio::join!(
                pump(stdout, &stage.name, &ctx.log),
                pump(stderr, &stage.name, &ctx.log),
            );
        };
        tokio::pin!(output);

        // The exit status decides the outcome; output is copied alongside
        // but never holds the stage open.
        let wait = async {
            let mut drained = false;
            loop {
                tokio::select! {
                    status = child.wait() => return (status, drained),
                    _ = &mut output, if !drained => drained = true,
                }
            }
        };

        let waited = if invocation.timeout_secs > 0 {
            let limit = Duration::from_secs(invocation.timeout_secs);
            tokio::time::timeout(limit, wait).await.ok()
        } else {
            Some(wait.await)
        };

        if waited.is_none() {
            if let Err(e) = child.kill().await {
                ctx.log
                    .alert(&stage.name, &format!("failed to kill timed-out process: {e}"));
            }
        }

        let drained = matches!(waited, Some((_, true)));
        if !drained && tokio::time::timeout(OUTPUT_GRACE, &mut output).await.is_err() {
            ctx.log.event(
                &stage.name,
                "output still held open after exit; no longer capturing",
            );
        }

        let Some((status, _)) = waited else {
            return Err(StageError::Timeout(invocation.timeout_secs));
        };
        status.map_err(|e| StageError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })
    }
}

fn policy_label(stage: &Stage) -> &'static str {
    if stage.policy.is_fatal() {
        "FATAL"
    } else {
        "SOFT"
    }
}

/// Copy lines from a child pipe into the run log until EOF.
async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, scope: &str, log: &RunLog) {
    let Some(reader) = reader else { return };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                log.output(scope, line.trim_end_matches(|c| c == '\n' || c == '\r'));
            }
            Err(e) => {
                log.alert(scope, &format!("output capture failed: {e}"));
                break;
            }
        }
    }
}
