//! `cadence.toml` loading and plan construction.
//!
//! Every field has a default reproducing the reference deployment, so a
//! missing file (or an empty one) yields a runnable configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cadence_core::{ArtifactDescriptor, FailurePolicy, FsArtifactStore, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::gate::ArtifactSpec;
use crate::pipeline::{PipelinePlan, PlanError, StandardStages};
use crate::stage::{BuiltinStage, Condition, Stage};

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "cadence.toml";

/// Logical name of the raw dataset artifact.
pub const RAW_ARTIFACT: &str = "raw";

/// Logical name of the training snapshot artifact.
pub const TRAINING_SET_ARTIFACT: &str = "training_set";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown stage [stages.{0}]; expected one of ingest, monitor, snapshot, train, promote")]
    UnknownStage(String),

    #[error("unknown artifact [artifacts.{0}]; expected raw or training_set")]
    UnknownArtifact(String),

    #[error("stage {0}: command must not be empty")]
    EmptyCommand(String),

    #[error("artifact {name}: path {path} must be relative to the workdir")]
    AbsolutePath { name: String, path: PathBuf },

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Working copy the pipeline operates on.
    pub workdir: PathBuf,

    pub branch: String,

    /// Git remote used by sync and publish.
    pub remote: String,

    /// Run log and run reports; relative to `workdir`.
    pub log_dir: PathBuf,

    pub store: StoreConfig,

    /// Overrides per builtin stage, keyed by stage name.
    pub stages: BTreeMap<String, StageConfig>,

    /// Overrides per versioned artifact, keyed by artifact name.
    pub artifacts: BTreeMap<String, ArtifactConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            branch: "main".to_string(),
            remote: "origin".to_string(),
            log_dir: PathBuf::from("logs"),
            store: StoreConfig::default(),
            stages: BTreeMap::new(),
            artifacts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Local content-addressed cache; relative to `workdir`.
    pub cache_dir: PathBuf,

    /// Remote store directory. Pushes are skipped when unset.
    pub remote_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".cadence/cache"),
            remote_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageConfig {
    pub command: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,

    /// 0 disables the timeout.
    pub timeout_secs: u64,

    pub precondition: Option<Condition>,
    pub postcondition: Option<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArtifactConfig {
    pub path: Option<PathBuf>,
    pub message: Option<String>,
    pub push_policy: Option<FailurePolicy>,
    pub retires: Option<PathBuf>,
}

impl PipelineConfig {
    /// Load and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(config = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parse and validate TOML text; `origin` is only used in errors.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, stage) in &self.stages {
            if !BuiltinStage::ALL.iter().any(|s| s.name() == name) {
                return Err(ConfigError::UnknownStage(name.clone()));
            }
            if matches!(&stage.command, Some(cmd) if cmd.is_empty()) {
                return Err(ConfigError::EmptyCommand(name.clone()));
            }
        }
        for name in self.artifacts.keys() {
            if name != RAW_ARTIFACT && name != TRAINING_SET_ARTIFACT {
                return Err(ConfigError::UnknownArtifact(name.clone()));
            }
        }
        for spec in [self.raw_artifact(), self.training_set_artifact()] {
            let d = &spec.descriptor;
            for path in std::iter::once(&d.path).chain(d.retires.iter()) {
                if path.is_absolute() {
                    return Err(ConfigError::AbsolutePath {
                        name: d.name.clone(),
                        path: path.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The raw dataset directory written by ingestion.
    pub fn raw_artifact(&self) -> ArtifactSpec {
        self.artifact_spec(
            RAW_ARTIFACT,
            "data/raw",
            "data: version raw dataset ({date})",
            FailurePolicy::Fatal,
        )
    }

    /// The training snapshot file written by the snapshot stage.
    pub fn training_set_artifact(&self) -> ArtifactSpec {
        self.artifact_spec(
            TRAINING_SET_ARTIFACT,
            "data/training_set.csv",
            "data: version training snapshot ({date})",
            FailurePolicy::Soft,
        )
    }

    pub fn artifact(&self, name: &str) -> Option<ArtifactSpec> {
        match name {
            RAW_ARTIFACT => Some(self.raw_artifact()),
            TRAINING_SET_ARTIFACT => Some(self.training_set_artifact()),
            _ => None,
        }
    }

    fn artifact_spec(
        &self,
        name: &str,
        path: &str,
        message: &str,
        push_policy: FailurePolicy,
    ) -> ArtifactSpec {
        let overrides = self.artifacts.get(name).cloned().unwrap_or_default();
        let mut descriptor =
            ArtifactDescriptor::new(name, overrides.path.unwrap_or_else(|| PathBuf::from(path)));
        descriptor.retires = overrides.retires;
        ArtifactSpec::new(descriptor, overrides.message.unwrap_or_else(|| message.to_string()))
            .with_push_policy(overrides.push_policy.unwrap_or(push_policy))
    }

    /// A builtin stage with default conditions and any configured overrides.
    pub fn stage(&self, builtin: BuiltinStage) -> Stage {
        let raw = self.raw_artifact();
        let training_set = self.training_set_artifact();
        let raw_ready = Condition::NonEmptyDir(raw.descriptor.path.clone());
        let snapshot_ready = Condition::NonEmptyFile(training_set.descriptor.path.clone());

        let mut stage = Stage::builtin(builtin);
        stage = match builtin {
            BuiltinStage::Ingest => stage.with_postcondition(raw_ready).producing(raw),
            BuiltinStage::Monitor => stage.with_precondition(raw_ready),
            BuiltinStage::Snapshot => stage
                .with_precondition(raw_ready)
                .with_postcondition(snapshot_ready)
                .producing(training_set),
            BuiltinStage::Train => stage.with_precondition(snapshot_ready),
            BuiltinStage::Promote => stage,
        };

        if let Some(overrides) = self.stages.get(builtin.name()) {
            if let Some(command) = &overrides.command {
                stage.invocation.command = command.clone();
            }
            stage.invocation.env.extend(overrides.env.clone());
            stage.invocation.timeout_secs = overrides.timeout_secs;
            if let Some(condition) = &overrides.precondition {
                stage.precondition = Some(condition.clone());
            }
            if let Some(condition) = &overrides.postcondition {
                stage.postcondition = Some(condition.clone());
            }
        }
        stage
    }

    /// The standard state table for this configuration.
    pub fn plan(&self) -> Result<PipelinePlan, ConfigError> {
        Ok(PipelinePlan::standard(StandardStages {
            ingest: self.stage(BuiltinStage::Ingest),
            monitor: self.stage(BuiltinStage::Monitor),
            snapshot: self.stage(BuiltinStage::Snapshot),
            train: self.stage(BuiltinStage::Train),
            promote: self.stage(BuiltinStage::Promote),
        })?)
    }

    /// Filesystem artifact store rooted at the workdir.
    pub fn open_store(&self) -> StoreResult<FsArtifactStore> {
        FsArtifactStore::open(
            &self.workdir,
            &self.store.cache_dir,
            self.store.remote_dir.as_deref(),
        )
    }
}
