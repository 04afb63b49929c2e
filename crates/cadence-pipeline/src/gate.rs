//! Version gate: record an artifact, and commit its pointer only when the
//! content actually changed.

use std::path::PathBuf;
use std::sync::Arc;

use cadence_core::{
    emit_gate_decision, ArtifactDescriptor, ArtifactStore, CommitOutcome, Digest, FailureKind,
    FailurePolicy, RevisionError, RevisionTracker, StoreError, VersionPointer, VersionedCommit,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::context::RunContext;

/// An artifact plus how the gate should treat it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub descriptor: ArtifactDescriptor,

    /// Commit message template. `{date}`, `{name}`, `{digest}` and
    /// `{run_id}` are substituted.
    pub message: String,

    /// Whether a failed push of this artifact aborts the gate.
    pub push_policy: FailurePolicy,
}

impl ArtifactSpec {
    pub fn new(descriptor: ArtifactDescriptor, message: impl Into<String>) -> Self {
        Self {
            descriptor,
            message: message.into(),
            push_policy: FailurePolicy::Fatal,
        }
    }

    pub fn with_push_policy(mut self, policy: FailurePolicy) -> Self {
        self.push_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// What the gate did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Content matches the last recorded version; nothing was committed.
    Unchanged { digest: Digest },

    /// A new pointer (and any retirement) was committed.
    Committed(VersionedCommit),
}

impl GateOutcome {
    pub fn commit(&self) -> Option<&VersionedCommit> {
        match self {
            GateOutcome::Committed(commit) => Some(commit),
            GateOutcome::Unchanged { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Revision(#[from] RevisionError),
}

impl GateError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GateError::Store(e) => e.kind(),
            GateError::Revision(e) => e.kind(),
        }
    }
}

/// Two-tier check: content diff first, then a conditional commit.
pub struct VersionGate {
    store: Arc<dyn ArtifactStore>,
    tracker: Arc<dyn RevisionTracker>,
}

impl VersionGate {
    pub fn new(store: Arc<dyn ArtifactStore>, tracker: Arc<dyn RevisionTracker>) -> Self {
        Self { store, tracker }
    }

    /// Record `spec`'s artifact and, if it changed, push it and commit its
    /// pointer. A pending retirement of a stale pointer is folded into the
    /// same commit and counts as a change on its own.
    ///
    /// On failure after the pointer was touched, the touched paths are
    /// restored to the revision head before the error is returned.
    pub async fn maybe_version_and_commit(
        &self,
        spec: &ArtifactSpec,
        ctx: &RunContext,
    ) -> Result<GateOutcome, GateError> {
        let name = spec.name();
        let pointer = self.store.record_version(&spec.descriptor).await?;
        let changed = self.store.diff_against_previous(&pointer).await?;

        let pointer_path = spec.descriptor.pointer_path();
        let retired = match &spec.descriptor.retires {
            Some(stale) => match self.store.retire(stale).await {
                Ok(retired) => retired,
                Err(e) => {
                    if changed {
                        self.rollback(ctx, name, &[pointer_path]).await;
                    }
                    return Err(e.into());
                }
            },
            None => None,
        };

        emit_gate_decision(name, &pointer.digest.short(), changed || retired.is_some());

        if !changed && retired.is_none() {
            ctx.log.event(
                name,
                &format!(
                    "unchanged at {} ({} files, {} bytes); no commit",
                    pointer.digest.short(),
                    pointer.files,
                    pointer.bytes
                ),
            );
            return Ok(GateOutcome::Unchanged {
                digest: pointer.digest,
            });
        }

        let mut touched = vec![pointer_path];
        touched.extend(retired.iter().cloned());

        if changed {
            ctx.log.event(
                name,
                &format!(
                    "new version {} ({} files, {} bytes)",
                    pointer.digest.short(),
                    pointer.files,
                    pointer.bytes
                ),
            );
            if let Err(e) = self.store.push(&pointer).await {
                if spec.push_policy.is_fatal() {
                    ctx.log.alert(name, &format!("{} (FATAL): {e}", e.kind()));
                    self.rollback(ctx, name, &touched).await;
                    return Err(e.into());
                }
                ctx.log.alert(
                    name,
                    &format!("{} (SOFT): {e}; committing pointer anyway", e.kind()),
                );
            }
        }
        if let Some(path) = &retired {
            ctx.log.event(name, &format!("retiring stale pointer {}", path.display()));
        }

        let message = render_message(&spec.message, ctx, &pointer);
        match self.tracker.stage_and_commit(&touched, &message).await {
            Ok(CommitOutcome::Committed { sha }) => {
                ctx.log.event(name, &format!("committed {} \"{message}\"", short_sha(&sha)));
                Ok(GateOutcome::Committed(VersionedCommit {
                    artifact: name.to_string(),
                    digest: pointer.digest,
                    commit: sha,
                    message,
                    committed_at: Utc::now(),
                    retired,
                }))
            }
            Ok(CommitOutcome::NoOp) => {
                ctx.log
                    .event(name, "pointer already matches the revision head; no commit");
                Ok(GateOutcome::Unchanged {
                    digest: pointer.digest,
                })
            }
            Err(e) => {
                ctx.log.alert(name, &format!("{}: {e}", e.kind()));
                self.rollback(ctx, name, &touched).await;
                Err(e.into())
            }
        }
    }

    async fn rollback(&self, ctx: &RunContext, name: &str, paths: &[PathBuf]) {
        match self.tracker.discard(paths).await {
            Ok(()) => ctx.log.event(
                name,
                &format!("rolled back {} uncommitted path(s)", paths.len()),
            ),
            Err(e) => ctx.log.alert(name, &format!("rollback failed: {e}")),
        }
    }
}

/// Expand a commit message template.
pub fn render_message(template: &str, ctx: &RunContext, pointer: &VersionPointer) -> String {
    template
        .replace("{date}", &ctx.run_date())
        .replace("{name}", &pointer.name)
        .replace("{digest}", &pointer.digest.short())
        .replace("{run_id}", &ctx.run_id)
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
