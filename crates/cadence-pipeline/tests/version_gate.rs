//! Integration tests for the version gate against the filesystem store, the
//! in-memory tracker and a real git working copy.

use cadence_core::fakes::{MemoryArtifactStore, MemoryRevisionTracker};
use cadence_core::{
    read_pointer, ArtifactDescriptor, FailureKind, FailurePolicy, FsArtifactStore,
    GitRevisionTracker, RevisionTracker,
};
use cadence_pipeline::{ArtifactSpec, GateOutcome, RunContext, VersionGate};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

fn context(dir: &Path) -> RunContext {
    RunContext::new(Utc::now(), dir, "main", Path::new("logs")).unwrap()
}

fn write_raw(dir: &Path, content: &str) {
    std::fs::create_dir_all(dir.join("data/raw")).unwrap();
    std::fs::write(dir.join("data/raw/ratings.csv"), content).unwrap();
}

fn raw_spec() -> ArtifactSpec {
    ArtifactSpec::new(
        ArtifactDescriptor::new("raw", "data/raw"),
        "data: version raw dataset ({date})",
    )
}

fn fs_store(dir: &Path) -> Arc<FsArtifactStore> {
    Arc::new(
        FsArtifactStore::open(dir, Path::new(".cadence/cache"), Some(Path::new("remote-store")))
            .unwrap(),
    )
}

/// Test: a second call on unchanged content records nothing new and commits nothing
#[tokio::test]
async fn test_gate_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "1,31,2.5\n");
    let store = Arc::new(MemoryArtifactStore::new(dir.path()));
    let tracker = Arc::new(MemoryRevisionTracker::new());
    let gate = VersionGate::new(store.clone(), tracker.clone());
    let ctx = context(dir.path());

    let first = gate.maybe_version_and_commit(&raw_spec(), &ctx).await.unwrap();
    let second = gate.maybe_version_and_commit(&raw_spec(), &ctx).await.unwrap();

    let commit = first.commit().expect("first call commits");
    assert_eq!(commit.artifact, "raw");
    assert!(commit.message.starts_with("data: version raw dataset ("));
    assert_eq!(second, GateOutcome::Unchanged { digest: commit.digest });
    assert_eq!(store.versions("raw").len(), 1);
    assert_eq!(tracker.commits().len(), 1);
}

/// Test: changed content after a recorded version is committed again
#[tokio::test]
async fn test_changed_content_commits_new_version() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "1,31,2.5\n");
    let store = fs_store(dir.path());
    let tracker = Arc::new(MemoryRevisionTracker::new());
    let gate = VersionGate::new(store.clone(), tracker.clone());
    let ctx = context(dir.path());

    let first = gate.maybe_version_and_commit(&raw_spec(), &ctx).await.unwrap();
    write_raw(dir.path(), "1,31,2.5\n1,1029,3.0\n");
    let second = gate.maybe_version_and_commit(&raw_spec(), &ctx).await.unwrap();

    let (a, b) = (first.commit().unwrap(), second.commit().unwrap());
    assert_ne!(a.digest, b.digest);
    assert_eq!(tracker.commits().len(), 2);

    let pointer = read_pointer(&dir.path().join("data/raw.ptr")).unwrap().unwrap();
    assert_eq!(pointer.digest, b.digest);
    assert_eq!(pointer.files, 1);
    assert!(dir.path().join("remote-store").exists(), "pushed to the remote store");
}

/// Test: a FATAL push failure rolls back the pointer and commits nothing
#[tokio::test]
async fn test_fatal_push_failure_discards_pointer() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "1,31,2.5\n");
    let store = Arc::new(MemoryArtifactStore::new(dir.path()).fail_push());
    let tracker = Arc::new(MemoryRevisionTracker::new());
    let gate = VersionGate::new(store, tracker.clone());
    let ctx = context(dir.path());

    let err = gate
        .maybe_version_and_commit(&raw_spec(), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::StorePushError);
    assert!(tracker.commits().is_empty());
    assert_eq!(tracker.discarded(), vec![PathBuf::from("data/raw.ptr")]);
}

/// Test: a SOFT push failure is logged and the pointer is still committed
#[tokio::test]
async fn test_soft_push_failure_still_commits() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("data")).unwrap();
    std::fs::write(dir.path().join("data/training_set.csv"), "user,movie,rating\n").unwrap();
    let store = Arc::new(MemoryArtifactStore::new(dir.path()).fail_push());
    let tracker = Arc::new(MemoryRevisionTracker::new());
    let gate = VersionGate::new(store, tracker.clone());
    let ctx = context(dir.path());
    let spec = ArtifactSpec::new(
        ArtifactDescriptor::new("training_set", "data/training_set.csv"),
        "snapshot {date}",
    )
    .with_push_policy(FailurePolicy::Soft);

    let outcome = gate.maybe_version_and_commit(&spec, &ctx).await.unwrap();
    assert!(outcome.commit().is_some());
    assert!(tracker.discarded().is_empty());

    let log = std::fs::read_to_string(ctx.log.path()).unwrap();
    assert!(log.contains("StorePushError (SOFT)"));
}

/// Test: commit failure rolls back and surfaces a CommitError
#[tokio::test]
async fn test_commit_failure_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "1,31,2.5\n");
    let store = Arc::new(MemoryArtifactStore::new(dir.path()));
    let tracker = Arc::new(MemoryRevisionTracker::new().fail_commit());
    let gate = VersionGate::new(store, tracker.clone());
    let ctx = context(dir.path());

    let err = gate
        .maybe_version_and_commit(&raw_spec(), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::CommitError);
    assert_eq!(tracker.discarded(), vec![PathBuf::from("data/raw.ptr")]);
}

/// Test: retiring a stale pointer happens in the same commit as the new version
#[tokio::test]
async fn test_retirement_folded_into_same_commit() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "1,31,2.5\n");
    let store = Arc::new(MemoryArtifactStore::new(dir.path()).with_stale_pointer("data/ratings.csv"));
    let tracker = Arc::new(MemoryRevisionTracker::new());
    let gate = VersionGate::new(store, tracker.clone());
    let ctx = context(dir.path());
    let spec = ArtifactSpec::new(
        ArtifactDescriptor::new("raw", "data/raw").retiring("data/ratings.csv"),
        "data: move to directory layout",
    );

    let outcome = gate.maybe_version_and_commit(&spec, &ctx).await.unwrap();
    let commit = outcome.commit().unwrap();
    assert_eq!(commit.retired, Some(PathBuf::from("data/ratings.csv.ptr")));

    let commits = tracker.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(
        commits[0].paths,
        vec![PathBuf::from("data/raw.ptr"), PathBuf::from("data/ratings.csv.ptr")]
    );
}

/// Test: a pending retirement is committed even when content is unchanged
#[tokio::test]
async fn test_pending_retirement_counts_as_change() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(dir.path(), "1,31,2.5\n");
    let store = fs_store(dir.path());
    let tracker = Arc::new(MemoryRevisionTracker::new());
    let gate = VersionGate::new(store, tracker.clone());
    let ctx = context(dir.path());

    let spec = ArtifactSpec::new(
        ArtifactDescriptor::new("raw", "data/raw").retiring("data/ratings.csv"),
        "data: raw ({date})",
    );
    let first = gate.maybe_version_and_commit(&spec, &ctx).await.unwrap();
    assert!(first.commit().unwrap().retired.is_none());

    // An old single-file pointer reappears, e.g. restored by a sync.
    std::fs::write(dir.path().join("data/ratings.csv.ptr"), "{}\n").unwrap();
    let second = gate.maybe_version_and_commit(&spec, &ctx).await.unwrap();
    let commit = second.commit().expect("retirement alone is committed");
    assert_eq!(commit.digest, first.commit().unwrap().digest);
    assert_eq!(commit.retired, Some(PathBuf::from("data/ratings.csv.ptr")));
    assert!(!dir.path().join("data/ratings.csv.ptr").exists());
    assert_eq!(tracker.commits().len(), 2);

    let third = gate.maybe_version_and_commit(&spec, &ctx).await.unwrap();
    assert!(third.commit().is_none());
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Test: against real git, unchanged data never produces an empty commit
#[tokio::test]
async fn test_gate_with_git_never_commits_noop() {
    let root = tempfile::tempdir().unwrap();
    let remote = root.path().join("remote.git");
    let work = root.path().join("work");
    git(root.path(), &["init", "--bare", "--quiet", "remote.git"]);
    git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(root.path(), &["init", "--quiet", "work"]);
    git(&work, &["config", "user.name", "test-user"]);
    git(&work, &["config", "user.email", "test@example.com"]);
    git(&work, &["checkout", "-q", "-b", "main"]);
    std::fs::write(work.join(".gitignore"), "data/raw/\n.cadence/\nlogs/\nremote-store/\n").unwrap();
    git(&work, &["add", ".gitignore"]);
    git(&work, &["commit", "-q", "-m", "initial"]);
    git(&work, &["remote", "add", "origin", remote.to_str().unwrap()]);
    git(&work, &["push", "-q", "origin", "main"]);

    write_raw(&work, "1,31,2.5\n");
    let tracker = Arc::new(GitRevisionTracker::new(&work, "origin"));
    let gate = VersionGate::new(fs_store(&work), tracker.clone());
    let ctx = context(&work);

    let first = gate.maybe_version_and_commit(&raw_spec(), &ctx).await.unwrap();
    let sha = first.commit().unwrap().commit.clone();
    assert_eq!(git(&work, &["rev-parse", "HEAD"]), sha);

    let second = gate.maybe_version_and_commit(&raw_spec(), &ctx).await.unwrap();
    assert!(second.commit().is_none());
    assert_eq!(git(&work, &["rev-list", "--count", "HEAD"]), "2");
    assert_eq!(git(&work, &["status", "--porcelain"]), "");

    tracker.publish("main").await.unwrap();
    assert_eq!(git(&remote, &["rev-parse", "main"]), sha);
}
