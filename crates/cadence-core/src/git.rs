//! Revision tracking: a linear, single-branch history of committed state.
//!
//! [`RevisionTracker`] is the contract the pipeline controller drives;
//! [`GitRevisionTracker`] implements it with the `git` CLI.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::{RevisionError, RevisionResult};

/// Result of a stage-and-commit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A commit was created.
    Committed { sha: String },
    /// Nothing differed from the current head; no commit was made.
    NoOp,
}

/// Source-control operations used by a pipeline run.
#[async_trait]
pub trait RevisionTracker: Send + Sync {
    /// Fetch and merge the latest state of `branch` into the working copy.
    async fn sync(&self, branch: &str) -> RevisionResult<()>;

    /// Stage `paths` and commit them if at least one differs from head.
    /// Never produces an empty commit.
    async fn stage_and_commit(&self, paths: &[PathBuf], message: &str)
        -> RevisionResult<CommitOutcome>;

    /// Push all local commits on `branch` to the remote.
    async fn publish(&self, branch: &str) -> RevisionResult<()>;

    /// Restore `paths` to their state at head, dropping staged and unstaged
    /// changes. Paths that do not exist at head are removed.
    async fn discard(&self, paths: &[PathBuf]) -> RevisionResult<()>;
}

/// Git-backed revision tracker operating on one working copy.
#[derive(Debug, Clone)]
pub struct GitRevisionTracker {
    repo_dir: PathBuf,
    remote: String,
}

impl GitRevisionTracker {
    pub fn new(repo_dir: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            remote: remote.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn git(&self, args: &[&str]) -> RevisionResult<Output> {
        debug!(args = ?args, "git");
        tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .map_err(|e| RevisionError::Git(format!("failed to run git: {e}")))
    }

    async fn git_with_paths(&self, args: &[&str], paths: &[PathBuf]) -> RevisionResult<Output> {
        let mut full: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        full.push("--".to_string());
        full.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        self.git(&refs).await
    }

    /// Whether the configured directory is inside a git work tree.
    pub async fn is_work_tree(&self) -> bool {
        match self.git(&["rev-parse", "--is-inside-work-tree"]).await {
            Ok(out) => {
                out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true"
            }
            Err(_) => false,
        }
    }

    /// Full SHA of the current head commit.
    pub async fn head_sha(&self) -> RevisionResult<String> {
        let out = self.git(&["rev-parse", "HEAD"]).await?;
        if !out.status.success() {
            return Err(RevisionError::Git(format!(
                "git rev-parse HEAD failed: {}",
                stderr_of(&out)
            )));
        }
        let sha = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if sha.is_empty() {
            return Err(RevisionError::Git("git rev-parse HEAD printed nothing".to_string()));
        }
        Ok(sha)
    }

    async fn exists_at_head(&self, path: &Path) -> RevisionResult<bool> {
        let spec = format!("HEAD:./{}", path.to_string_lossy());
        Ok(self.git(&["cat-file", "-e", &spec]).await?.status.success())
    }
}

#[async_trait]
impl RevisionTracker for GitRevisionTracker {
    async fn sync(&self, branch: &str) -> RevisionResult<()> {
        let sync_err = |reason: String| RevisionError::Sync {
            branch: branch.to_string(),
            reason,
        };

        let checkout = self.git(&["checkout", "--quiet", branch]).await?;
        if !checkout.status.success() {
            return Err(sync_err(stderr_of(&checkout)));
        }

        // Rebase keeps history linear and replays commits left unpublished
        // by an interrupted run.
        let pull = self
            .git(&["pull", "--rebase", "--autostash", "--quiet", &self.remote, branch])
            .await?;
        if !pull.status.success() {
            let reason = stderr_of(&pull);
            if let Ok(abort) = self.git(&["rebase", "--abort"]).await {
                if !abort.status.success() {
                    debug!("no rebase in progress to abort");
                }
            }
            return Err(sync_err(reason));
        }

        info!(branch = %branch, remote = %self.remote, "Synchronized working copy");
        Ok(())
    }

    async fn stage_and_commit(
        &self,
        paths: &[PathBuf],
        message: &str,
    ) -> RevisionResult<CommitOutcome> {
        if paths.is_empty() {
            return Ok(CommitOutcome::NoOp);
        }

        let add = self.git_with_paths(&["add", "--all"], paths).await?;
        if !add.status.success() {
            return Err(RevisionError::Commit(format!(
                "git add failed: {}",
                stderr_of(&add)
            )));
        }

        let diff = self
            .git_with_paths(&["diff", "--cached", "--quiet"], paths)
            .await?;
        match diff.status.code() {
            Some(0) => {
                debug!(paths = ?paths, "Staged paths match head, skipping commit");
                return Ok(CommitOutcome::NoOp);
            }
            Some(1) => {}
            _ => {
                return Err(RevisionError::Commit(format!(
                    "git diff failed: {}",
                    stderr_of(&diff)
                )))
            }
        }

        let commit = self
            .git_with_paths(&["commit", "--quiet", "-m", message], paths)
            .await?;
        if !commit.status.success() {
            return Err(RevisionError::Commit(format!(
                "git commit failed: {}",
                stderr_of(&commit)
            )));
        }

        let sha = self.head_sha().await.map_err(|e| RevisionError::Commit(e.to_string()))?;
        info!(sha = %sha, message = %message, "Created commit");
        Ok(CommitOutcome::Committed { sha })
    }

    async fn publish(&self, branch: &str) -> RevisionResult<()> {
        let refspec = format!("HEAD:{branch}");
        let push = self
            .git(&["push", "--quiet", &self.remote, &refspec])
            .await?;
        if !push.status.success() {
            return Err(RevisionError::Publish {
                branch: branch.to_string(),
                reason: stderr_of(&push),
            });
        }
        info!(branch = %branch, remote = %self.remote, "Published commits");
        Ok(())
    }

    async fn discard(&self, paths: &[PathBuf]) -> RevisionResult<()> {
        for path in paths {
            if self.exists_at_head(path).await? {
                let out = self
                    .git_with_paths(&["checkout", "HEAD"], std::slice::from_ref(path))
                    .await?;
                if !out.status.success() {
                    return Err(RevisionError::Discard(format!(
                        "{}: {}",
                        path.display(),
                        stderr_of(&out)
                    )));
                }
            } else {
                let out = self
                    .git_with_paths(
                        &["rm", "--cached", "--quiet", "--ignore-unmatch"],
                        std::slice::from_ref(path),
                    )
                    .await?;
                if !out.status.success() {
                    return Err(RevisionError::Discard(format!(
                        "{}: {}",
                        path.display(),
                        stderr_of(&out)
                    )));
                }
                let absolute = self.repo_dir.join(path);
                if absolute.is_file() {
                    std::fs::remove_file(&absolute)
                        .map_err(|e| RevisionError::Discard(format!("{}: {e}", path.display())))?;
                }
            }
            warn!(path = %path.display(), "Discarded uncommitted change");
        }
        Ok(())
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn configure(repo_dir: &Path) {
        run_git(repo_dir, &["config", "user.name", "test-user"]);
        run_git(repo_dir, &["config", "user.email", "test@example.com"]);
    }

    /// A bare remote plus a clone on `main` with one initial commit.
    fn make_clone() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let remote = root.path().join("remote.git");
        let work = root.path().join("work");
        run_git(root.path(), &["init", "--bare", "--quiet", "remote.git"]);
        run_git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        run_git(root.path(), &["init", "--quiet", "work"]);
        configure(&work);
        run_git(&work, &["checkout", "-q", "-b", "main"]);
        std::fs::write(work.join("README.md"), "refresh\n").unwrap();
        run_git(&work, &["add", "README.md"]);
        run_git(&work, &["commit", "-q", "-m", "initial"]);
        run_git(&work, &["remote", "add", "origin", remote.to_str().unwrap()]);
        run_git(&work, &["push", "-q", "origin", "main"]);
        (root, remote, work)
    }

    fn commit_count(repo_dir: &Path) -> usize {
        run_git(repo_dir, &["rev-list", "--count", "HEAD"]).parse().unwrap()
    }

    #[tokio::test]
    async fn head_sha_is_40_hex_chars() {
        let (_root, _remote, work) = make_clone();
        let tracker = GitRevisionTracker::new(&work, "origin");
        assert!(tracker.is_work_tree().await);
        let sha = tracker.head_sha().await.unwrap();
        assert_eq!(sha.len(), 40, "got: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sha, run_git(&work, &["rev-parse", "HEAD"]));
    }

    #[tokio::test]
    async fn plain_directory_is_not_a_work_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = GitRevisionTracker::new(dir.path(), "origin");
        assert!(!tracker.is_work_tree().await);
        assert!(matches!(tracker.head_sha().await, Err(RevisionError::Git(_))));
    }

    #[tokio::test]
    async fn commit_reports_new_head() {
        let (_root, _remote, work) = make_clone();
        std::fs::write(work.join("raw.ptr"), "{\"digest\":\"b\"}\n").unwrap();
        let tracker = GitRevisionTracker::new(&work, "origin");
        let outcome = tracker
            .stage_and_commit(&[PathBuf::from("raw.ptr")], "data: refresh raw")
            .await
            .unwrap();
        let sha = run_git(&work, &["rev-parse", "HEAD"]);
        assert_eq!(outcome, CommitOutcome::Committed { sha });
    }

    #[tokio::test]
    async fn stage_and_commit_creates_one_commit() {
        let (_root, _remote, work) = make_clone();
        std::fs::write(work.join("raw.ptr"), "{\"digest\":\"a\"}\n").unwrap();
        let tracker = GitRevisionTracker::new(&work, "origin");

        let outcome = tracker
            .stage_and_commit(&[PathBuf::from("raw.ptr")], "data: refresh raw")
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
        assert_eq!(commit_count(&work), 2);
    }

    #[tokio::test]
    async fn stage_and_commit_unchanged_is_noop() {
        let (_root, _remote, work) = make_clone();
        let tracker = GitRevisionTracker::new(&work, "origin");
        let outcome = tracker
            .stage_and_commit(&[PathBuf::from("README.md")], "no change")
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::NoOp);
        assert_eq!(commit_count(&work), 1);
    }

    #[tokio::test]
    async fn removal_and_addition_share_a_commit() {
        let (_root, _remote, work) = make_clone();
        std::fs::write(work.join("old.ptr"), "old\n").unwrap();
        run_git(&work, &["add", "old.ptr"]);
        run_git(&work, &["commit", "-q", "-m", "old pointer"]);

        std::fs::remove_file(work.join("old.ptr")).unwrap();
        std::fs::write(work.join("new.ptr"), "new\n").unwrap();
        let tracker = GitRevisionTracker::new(&work, "origin");
        tracker
            .stage_and_commit(
                &[PathBuf::from("new.ptr"), PathBuf::from("old.ptr")],
                "data: migrate format",
            )
            .await
            .unwrap();

        let changed = run_git(&work, &["show", "--name-status", "--format=", "HEAD"]);
        assert!(changed.contains("A\tnew.ptr"), "got: {changed}");
        assert!(changed.contains("D\told.ptr"), "got: {changed}");
    }

    #[tokio::test]
    async fn publish_pushes_local_commits() {
        let (_root, remote, work) = make_clone();
        std::fs::write(work.join("raw.ptr"), "v2\n").unwrap();
        let tracker = GitRevisionTracker::new(&work, "origin");
        tracker
            .stage_and_commit(&[PathBuf::from("raw.ptr")], "data: v2")
            .await
            .unwrap();
        tracker.publish("main").await.unwrap();

        let head = run_git(&work, &["rev-parse", "HEAD"]);
        assert_eq!(run_git(&remote, &["rev-parse", "main"]), head);
    }

    #[tokio::test]
    async fn sync_pulls_remote_changes() {
        let (root, remote, work) = make_clone();
        let other = root.path().join("other");
        run_git(root.path(), &["clone", "-q", remote.to_str().unwrap(), "other"]);
        configure(&other);
        std::fs::write(other.join("CHANGELOG.md"), "upstream\n").unwrap();
        run_git(&other, &["add", "CHANGELOG.md"]);
        run_git(&other, &["commit", "-q", "-m", "upstream change"]);
        run_git(&other, &["push", "-q", "origin", "main"]);

        let tracker = GitRevisionTracker::new(&work, "origin");
        tracker.sync("main").await.unwrap();
        assert!(work.join("CHANGELOG.md").exists());
    }

    #[tokio::test]
    async fn sync_unknown_branch_is_sync_error() {
        let (_root, _remote, work) = make_clone();
        let tracker = GitRevisionTracker::new(&work, "origin");
        let err = tracker.sync("does-not-exist").await.unwrap_err();
        assert!(matches!(err, RevisionError::Sync { .. }));
    }

    #[tokio::test]
    async fn publish_to_missing_remote_is_publish_error() {
        let (_root, _remote, work) = make_clone();
        let tracker = GitRevisionTracker::new(&work, "nowhere");
        let err = tracker.publish("main").await.unwrap_err();
        assert!(matches!(err, RevisionError::Publish { .. }));
    }

    #[tokio::test]
    async fn discard_restores_tracked_and_removes_new_paths() {
        let (_root, _remote, work) = make_clone();
        std::fs::write(work.join("README.md"), "edited\n").unwrap();
        std::fs::write(work.join("fresh.ptr"), "new\n").unwrap();
        run_git(&work, &["add", "fresh.ptr"]);

        let tracker = GitRevisionTracker::new(&work, "origin");
        tracker
            .discard(&[PathBuf::from("README.md"), PathBuf::from("fresh.ptr")])
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(work.join("README.md")).unwrap(), "refresh\n");
        assert!(!work.join("fresh.ptr").exists());
        assert_eq!(run_git(&work, &["status", "--porcelain"]), "");
    }
}
