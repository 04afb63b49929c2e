//! Machine-readable run report.

use std::path::{Path, PathBuf};

use anyhow::Context;
use cadence_core::PipelineRun;

/// Write `<dir>/<run_id>.json` and return its path.
pub fn write_run_report(dir: &Path, run: &PipelineRun) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
    let path = dir.join(format!("{}.json", run.run_id()));
    let json = serde_json::to_string_pretty(run).context("Failed to serialize run report")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write run report {}", path.display()))?;
    Ok(path)
}

/// Read a report written by [`write_run_report`].
pub fn read_run_report(path: &Path) -> anyhow::Result<PipelineRun> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read run report {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("Invalid run report {}", path.display()))
}
