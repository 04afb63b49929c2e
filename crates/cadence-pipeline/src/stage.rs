//! Stage definitions: what to run, how failure is treated, and the
//! filesystem conditions checked around it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use cadence_core::FailurePolicy;
use serde::{Deserialize, Serialize};

use crate::gate::ArtifactSpec;

/// External collaborators of the refresh pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStage {
    /// Download the dataset into the raw-data location and load it.
    Ingest,

    /// Quality, drift and KPI signals. Always SOFT.
    Monitor,

    /// Export the training snapshot file.
    Snapshot,

    /// Train and register model variants.
    Train,

    /// Mark the best registered variant as the active one.
    Promote,
}

impl BuiltinStage {
    pub const ALL: [BuiltinStage; 5] = [
        BuiltinStage::Ingest,
        BuiltinStage::Monitor,
        BuiltinStage::Snapshot,
        BuiltinStage::Train,
        BuiltinStage::Promote,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStage::Ingest => "ingest",
            BuiltinStage::Monitor => "monitor",
            BuiltinStage::Snapshot => "snapshot",
            BuiltinStage::Train => "train",
            BuiltinStage::Promote => "promote",
        }
    }

    /// Default command of the reference deployment.
    pub fn default_command(&self) -> Vec<String> {
        let module = match self {
            BuiltinStage::Ingest => "src.monitoring.run_ingestion_with_monitoring",
            BuiltinStage::Monitor => "src.monitoring.run_data_monitoring_pipeline",
            BuiltinStage::Snapshot => "src.ingestion.create_snapshot",
            BuiltinStage::Train => "src.models.train_model2",
            BuiltinStage::Promote => "src.models.promote_best_model",
        };
        vec!["python".to_string(), "-m".to_string(), module.to_string()]
    }

    pub fn policy(&self) -> FailurePolicy {
        match self {
            BuiltinStage::Monitor => FailurePolicy::Soft,
            _ => FailurePolicy::Fatal,
        }
    }
}

impl fmt::Display for BuiltinStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A filesystem check evaluated before or after a stage, relative to the workdir.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "check", content = "path", rename_all = "snake_case")]
pub enum Condition {
    /// Directory exists and contains at least one non-hidden entry.
    NonEmptyDir(PathBuf),

    /// File exists.
    FileExists(PathBuf),

    /// File exists and has non-zero length.
    NonEmptyFile(PathBuf),
}

impl Condition {
    /// `Ok(())` if the condition holds, otherwise a human-readable reason.
    pub fn check(&self, workdir: &Path) -> Result<(), String> {
        match self {
            Condition::NonEmptyDir(path) => {
                let full = workdir.join(path);
                let entries = std::fs::read_dir(&full)
                    .map_err(|e| format!("directory {} unreadable: {e}", path.display()))?;
                let has_data = entries.filter_map(|e| e.ok()).any(|e| {
                    !e.file_name().to_string_lossy().starts_with('.')
                });
                if has_data {
                    Ok(())
                } else {
                    Err(format!("directory {} is empty", path.display()))
                }
            }
            Condition::FileExists(path) => {
                if workdir.join(path).is_file() {
                    Ok(())
                } else {
                    Err(format!("file {} does not exist", path.display()))
                }
            }
            Condition::NonEmptyFile(path) => match std::fs::metadata(workdir.join(path)) {
                Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
                Ok(meta) if meta.is_file() => Err(format!("file {} is empty", path.display())),
                _ => Err(format!("file {} does not exist", path.display())),
            },
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::NonEmptyDir(p) => write!(f, "non-empty dir {}", p.display()),
            Condition::FileExists(p) => write!(f, "file {} exists", p.display()),
            Condition::NonEmptyFile(p) => write!(f, "non-empty file {}", p.display()),
        }
    }
}

/// How to execute a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invocation {
    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Timeout in seconds; 0 disables the timeout.
    #[serde(default)]
    pub timeout_secs: u64,
}

impl Invocation {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            timeout_secs: 0,
        }
    }

    /// `sh -c <script>`, handy for glue stages and tests.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(vec!["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// One discrete unit of pipeline work with a declared failure policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub invocation: Invocation,
    pub policy: FailurePolicy,
    pub precondition: Option<Condition>,
    pub postcondition: Option<Condition>,

    /// Artifacts this stage produces. The plan versions them in the state
    /// that follows the stage.
    pub artifacts: Vec<ArtifactSpec>,
}

impl Stage {
    pub fn new(name: impl Into<String>, invocation: Invocation) -> Self {
        Self {
            name: name.into(),
            invocation,
            policy: FailurePolicy::Fatal,
            precondition: None,
            postcondition: None,
            artifacts: Vec::new(),
        }
    }

    /// A builtin stage with its default command and policy.
    pub fn builtin(stage: BuiltinStage) -> Self {
        Self::new(stage.name(), Invocation::new(stage.default_command())).with_policy(stage.policy())
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn soft(self) -> Self {
        self.with_policy(FailurePolicy::Soft)
    }

    pub fn with_precondition(mut self, condition: Condition) -> Self {
        self.precondition = Some(condition);
        self
    }

    pub fn with_postcondition(mut self, condition: Condition) -> Self {
        self.postcondition = Some(condition);
        self
    }

    pub fn producing(mut self, artifact: ArtifactSpec) -> Self {
        self.artifacts.push(artifact);
        self
    }
}
