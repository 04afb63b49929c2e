//! Cadence - scheduled data-and-model refresh controller
//!
//! The `cadence` command is the single entry point an external scheduler
//! invokes.
//!
//! ## Commands
//!
//! - `run`: execute one pipeline run (exit 0 on DONE, 1 on ABORTED)
//! - `plan`: print the state table for the loaded configuration
//! - `version`: version one configured artifact outside a run
//! - `fingerprint`: print the content fingerprint of a file or directory

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cadence_core::{
    build_manifest, run_span, ArtifactKind, ArtifactStore, GitRevisionTracker, PipelineRun,
    RevisionTracker,
};
use cadence_pipeline::{
    write_run_report, GateOutcome, PipelineConfig, PipelineController, RunContext, VersionGate,
    DEFAULT_CONFIG_FILE,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{warn, Instrument, Level};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Scheduled data-and-model refresh controller", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (missing file means built-in defaults)
    #[arg(short, long, global = true, env = "CADENCE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Branch to sync and publish (overrides the config file)
    #[arg(long, global = true, env = "CADENCE_BRANCH")]
    branch: Option<String>,

    /// Working copy to operate on (overrides the config file)
    #[arg(long, global = true, env = "CADENCE_WORKDIR")]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one pipeline run
    Run,

    /// Print the state table without executing anything
    Plan,

    /// Version one configured artifact outside a run (no sync, no publish)
    Version {
        /// Artifact name (raw or training_set)
        artifact: String,
    },

    /// Print the content fingerprint of a file or directory
    Fingerprint {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    cadence_core::init_tracing(cli.json, level);

    match &cli.command {
        Commands::Fingerprint { path } => cmd_fingerprint(path, cli.json),
        Commands::Plan => {
            let config = load_config(&cli)?;
            cmd_plan(&config, cli.json)
        }
        Commands::Run => {
            let config = load_config(&cli)?;
            let tracker = open_tracker(&config).await?;
            let store = Arc::new(config.open_store().context("Failed to open artifact store")?);
            cmd_run(&config, store, tracker).await
        }
        Commands::Version { artifact } => {
            let config = load_config(&cli)?;
            let tracker = open_tracker(&config).await?;
            let store = Arc::new(config.open_store().context("Failed to open artifact store")?);
            cmd_version(&config, artifact, store, tracker).await
        }
    }
}

/// Load `cadence.toml` and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    if let Some(branch) = &cli.branch {
        config.branch = branch.clone();
    }
    if let Some(workdir) = &cli.workdir {
        config.workdir = workdir.clone();
    }
    Ok(config)
}

/// The git tracker for the configured working copy, which must be a work tree.
async fn open_tracker(config: &PipelineConfig) -> Result<Arc<GitRevisionTracker>> {
    let tracker = GitRevisionTracker::new(&config.workdir, &config.remote);
    if !tracker.is_work_tree().await {
        bail!(
            "{} is not a git working copy (set --workdir or `workdir` in the config)",
            config.workdir.display()
        );
    }
    Ok(Arc::new(tracker))
}

fn open_context(config: &PipelineConfig) -> Result<RunContext> {
    RunContext::new(Utc::now(), &config.workdir, &config.branch, &config.log_dir)
        .with_context(|| format!("Failed to open run log in {}", config.log_dir.display()))
}

async fn cmd_run(
    config: &PipelineConfig,
    store: Arc<dyn ArtifactStore>,
    tracker: Arc<dyn RevisionTracker>,
) -> Result<ExitCode> {
    let run = execute_run(config, store, tracker).await?;
    print_summary(&run);

    Ok(if run.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// One pipeline run plus its report. The report is best effort.
async fn execute_run(
    config: &PipelineConfig,
    store: Arc<dyn ArtifactStore>,
    tracker: Arc<dyn RevisionTracker>,
) -> Result<PipelineRun> {
    let ctx = open_context(config)?;
    let plan = config.plan().context("Invalid pipeline plan")?;
    let controller = PipelineController::new(plan, store, tracker);
    let run = controller.run(&ctx).await;

    match write_run_report(ctx.log_dir(), &run) {
        Ok(path) => ctx
            .log
            .event("run", &format!("report written to {}", path.display())),
        Err(e) => warn!(error = %format!("{e:#}"), "Failed to write run report"),
    }
    Ok(run)
}

fn print_summary(run: &PipelineRun) {
    println!();
    println!("Run ID: {}", run.run_id());
    match run.aborted_in() {
        None => println!("Status: ✓ DONE"),
        Some(state) => println!("Status: ✗ ABORTED in {state}"),
    }
    if let Some(ms) = run.duration_ms() {
        println!("Duration: {ms}ms");
    }
    println!();

    for stage in run.stages() {
        let status = if stage.passed() { "✓" } else { "✗" };
        let detail = match &stage.failure {
            Some(failure) => format!(" [{}: {}]", failure.kind, failure.message),
            None => String::new(),
        };
        println!(
            "  {} {} ({}ms, {:?}){}",
            status, stage.stage, stage.duration_ms, stage.policy, detail
        );
    }

    if !run.commits().is_empty() {
        println!();
        for commit in run.commits() {
            println!(
                "  commit {} {} -> {}",
                commit.commit.get(..8).unwrap_or(&commit.commit),
                commit.artifact,
                commit.digest.short()
            );
        }
    }
}

#[derive(Serialize)]
struct PlanRow {
    state: String,
    step: String,
    policy: String,
    next: String,
}

fn plan_rows(config: &PipelineConfig) -> Result<Vec<PlanRow>> {
    let plan = config.plan().context("Invalid pipeline plan")?;
    Ok(plan
        .transitions()
        .iter()
        .map(|t| PlanRow {
            state: t.state.to_string(),
            step: t.step.to_string(),
            policy: if t.policy.is_fatal() { "FATAL" } else { "SOFT" }.to_string(),
            next: t.next.to_string(),
        })
        .collect())
}

fn cmd_plan(config: &PipelineConfig, json: bool) -> Result<ExitCode> {
    let rows = plan_rows(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "Branch: {} ({}), workdir: {}",
        config.branch,
        config.remote,
        config.workdir.display()
    );
    println!();
    for row in &rows {
        println!(
            "  {:<20} {:<6} {} -> {}",
            row.state, row.policy, row.step, row.next
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_version(
    config: &PipelineConfig,
    artifact: &str,
    store: Arc<dyn ArtifactStore>,
    tracker: Arc<dyn RevisionTracker>,
) -> Result<ExitCode> {
    let spec = config
        .artifact(artifact)
        .with_context(|| format!("Unknown artifact: {artifact} (expected raw or training_set)"))?;
    let ctx = open_context(config)?;
    let gate = VersionGate::new(store, tracker);

    let outcome = gate
        .maybe_version_and_commit(&spec, &ctx)
        .instrument(run_span(&ctx.run_id))
        .await
        .with_context(|| format!("Failed to version {artifact}"))?;

    match outcome {
        GateOutcome::Unchanged { digest } => {
            println!("{artifact}: unchanged ({})", digest.short());
        }
        GateOutcome::Committed(commit) => {
            println!(
                "{artifact}: committed {} ({}) \"{}\"",
                commit.commit.get(..8).unwrap_or(&commit.commit),
                commit.digest.short(),
                commit.message
            );
            println!("Not published; the next `cadence run` publishes it.");
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct FingerprintReport {
    path: PathBuf,
    digest: String,
    kind: ArtifactKind,
    files: u64,
    bytes: u64,
}

fn fingerprint_report(path: &Path) -> Result<FingerprintReport> {
    let manifest = build_manifest(path, None)
        .with_context(|| format!("Failed to fingerprint {}", path.display()))?;
    Ok(FingerprintReport {
        path: path.to_path_buf(),
        digest: manifest.digest()?.to_hex(),
        kind: manifest.kind,
        files: manifest.file_count(),
        bytes: manifest.total_bytes(),
    })
}

fn cmd_fingerprint(path: &Path, json: bool) -> Result<ExitCode> {
    let report = fingerprint_report(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{}  {} ({} files, {} bytes)",
            report.digest,
            report.path.display(),
            report.files,
            report.bytes
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::fakes::{MemoryArtifactStore, MemoryRevisionTracker};
    use cadence_pipeline::config::StageConfig;
    use clap::CommandFactory;

    fn sh(script: &str) -> StageConfig {
        StageConfig {
            command: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
            ..Default::default()
        }
    }

    fn workspace_config(dir: &Path, train: &str) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.workdir = dir.to_path_buf();
        config.stages.insert(
            "ingest".to_string(),
            sh("mkdir -p data/raw && echo 1,1,5 > data/raw/ratings.csv"),
        );
        config.stages.insert("monitor".to_string(), sh("true"));
        config.stages.insert(
            "snapshot".to_string(),
            sh("cp data/raw/ratings.csv data/training_set.csv"),
        );
        config.stages.insert("train".to_string(), sh(train));
        config.stages.insert("promote".to_string(), sh("true"));
        config
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_global_overrides() {
        let cli = Cli::try_parse_from([
            "cadence",
            "--branch",
            "release",
            "--workdir",
            "/srv/recsys",
            "version",
            "raw",
        ])
        .unwrap();
        assert_eq!(cli.branch.as_deref(), Some("release"));
        assert!(matches!(cli.command, Commands::Version { ref artifact } if artifact == "raw"));

        let config = load_config(&Cli {
            config: PathBuf::from("/nonexistent/cadence.toml"),
            ..cli
        })
        .unwrap();
        assert_eq!(config.branch, "release");
        assert_eq!(config.workdir, PathBuf::from("/srv/recsys"));
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        std::fs::write(&path, "[stages.ingest]\ncommand = []\n").unwrap();
        let cli = Cli::try_parse_from(["cadence", "--config", path.to_str().unwrap(), "plan"]).unwrap();
        let err = load_config(&cli).unwrap_err();
        assert!(format!("{err:#}").contains("command must not be empty"));
    }

    #[test]
    fn test_plan_rows() {
        let rows = plan_rows(&PipelineConfig::default()).unwrap();
        assert_eq!(rows.len(), 9);
        assert_eq!(rows[0].state, "PULLING");
        assert_eq!(rows[3].policy, "SOFT");
        assert_eq!(rows[8].next, "DONE");
        assert!(rows[1].step.contains("src.monitoring.run_ingestion_with_monitoring"));
    }

    #[test]
    fn test_fingerprint_report() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "1,2\n").unwrap();
        std::fs::write(dir.path().join("b.csv"), "3,4\n").unwrap();

        let report = fingerprint_report(dir.path()).unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 8);
        assert_eq!(report.digest.len(), 64);
        assert!(matches!(report.kind, ArtifactKind::Directory));
        assert!(fingerprint_report(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_open_tracker_requires_work_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.workdir = dir.path().to_path_buf();

        let err = open_tracker(&config).await.unwrap_err();
        assert!(err.to_string().contains("is not a git working copy"));

        let status = std::process::Command::new("git")
            .args(["init", "--quiet"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        assert!(status.success());
        let tracker = open_tracker(&config).await.unwrap();
        assert_eq!(tracker.repo_dir(), dir.path());
    }

    #[tokio::test]
    async fn test_execute_run_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let config = workspace_config(dir.path(), "true");
        let store = Arc::new(MemoryArtifactStore::new(dir.path()));
        let tracker = Arc::new(MemoryRevisionTracker::new());

        let run = execute_run(&config, store, tracker.clone()).await.unwrap();
        assert!(run.is_success());
        assert_eq!(tracker.publishes().len(), 1);

        let report = dir.path().join("logs").join(format!("{}.json", run.run_id()));
        let parsed = cadence_pipeline::read_run_report(&report).unwrap();
        assert_eq!(parsed.stages().len(), 9);
    }

    #[tokio::test]
    async fn test_execute_run_reports_abort() {
        let dir = tempfile::tempdir().unwrap();
        let config = workspace_config(dir.path(), "exit 1");
        let store = Arc::new(MemoryArtifactStore::new(dir.path()));
        let tracker = Arc::new(MemoryRevisionTracker::new());

        let run = execute_run(&config, store, tracker.clone()).await.unwrap();
        assert!(!run.is_success());
        assert_eq!(run.aborted_in(), Some("TRAINING"));
        assert!(tracker.publishes().is_empty());
    }

    #[tokio::test]
    async fn test_cmd_version_commits_without_publishing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/raw")).unwrap();
        std::fs::write(dir.path().join("data/raw/ratings.csv"), "1,1,5\n").unwrap();
        let mut config = PipelineConfig::default();
        config.workdir = dir.path().to_path_buf();
        let tracker = Arc::new(MemoryRevisionTracker::new());

        let store = Arc::new(MemoryArtifactStore::new(dir.path()));
        cmd_version(&config, "raw", store.clone(), tracker.clone())
            .await
            .unwrap();
        assert_eq!(tracker.commits().len(), 1);
        assert!(tracker.publishes().is_empty());
        assert!(tracker.syncs().is_empty());

        let err = cmd_version(&config, "models", store, tracker)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown artifact: models"));
    }
}
