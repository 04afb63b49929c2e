//! Per-run context and the append-only run log.
//!
//! A [`RunContext`] is built once per run and handed to every component; no
//! component reads the log file, working directory or branch from ambient
//! state.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cadence_core::{run_id_for, OutputRef, StageStatus};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// File name of the run log inside the log directory.
pub const RUN_LOG_FILE: &str = "cadence.log";

/// Append-only, timestamped UTF-8 log shared by every run.
///
/// Each line is `<utc timestamp> <run id> [<scope>] <message>`. Lines are
/// mirrored to stdout through `tracing`.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    run_id: String,
    file: Mutex<File>,
}

impl RunLog {
    /// Open (or create) `<dir>/cadence.log` in append mode.
    pub fn open(dir: &Path, run_id: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(RUN_LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            run_id: run_id.to_string(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current end of the log, in bytes.
    pub fn offset(&self) -> u64 {
        match self.file.lock() {
            Ok(file) => file.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Reference to everything appended since `start`.
    pub fn since(&self, start: u64) -> OutputRef {
        OutputRef {
            log: self.path.clone(),
            start,
            end: self.offset(),
        }
    }

    /// A significant event (stage result, gate decision, abort reason).
    pub fn event(&self, scope: &str, message: &str) {
        info!(scope = %scope, "{message}");
        self.append(scope, message);
    }

    /// A failure or anomaly; same file, mirrored at warn level.
    pub fn alert(&self, scope: &str, message: &str) {
        warn!(scope = %scope, "{message}");
        self.append(scope, message);
    }

    /// One line of captured stage output.
    pub fn output(&self, scope: &str, line: &str) {
        info!(scope = %scope, output = true, "{line}");
        self.append(scope, line);
    }

    pub fn stage_start(&self, stage: &str) {
        self.event(stage, &format!("=== START {stage} ==="));
    }

    pub fn stage_end(&self, stage: &str, status: StageStatus, duration_ms: u64) {
        let status = match status {
            StageStatus::Ok => "OK",
            StageStatus::Failed => "FAILED",
        };
        self.event(stage, &format!("=== END {stage}: {status} ({duration_ms} ms) ==="));
    }

    fn append(&self, scope: &str, message: &str) {
        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("{ts} {} [{scope}] {message}\n", self.run_id);
        let written = match self.file.lock() {
            Ok(mut file) => file.write_all(line.as_bytes()).and_then(|_| file.flush()),
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "run log lock poisoned")),
        };
        if let Err(e) = written {
            warn!(log = %self.path.display(), error = %e, "Failed to append to run log");
        }
    }
}

/// Everything a component needs to know about the current run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub workdir: PathBuf,
    pub branch: String,
    pub log: RunLog,
}

impl RunContext {
    /// `log_dir` is resolved against `workdir` when relative.
    pub fn new(
        started_at: DateTime<Utc>,
        workdir: impl Into<PathBuf>,
        branch: impl Into<String>,
        log_dir: &Path,
    ) -> io::Result<Self> {
        let workdir = workdir.into();
        let run_id = run_id_for(started_at);
        let log = RunLog::open(&workdir.join(log_dir), &run_id)?;
        Ok(Self {
            run_id,
            started_at,
            workdir,
            branch: branch.into(),
            log,
        })
    }

    /// Run date used in commit messages (`2026-10-16`).
    pub fn run_date(&self) -> String {
        self.started_at.format("%Y-%m-%d").to_string()
    }

    pub fn log_dir(&self) -> &Path {
        self.log.path().parent().unwrap_or(&self.workdir)
    }
}
