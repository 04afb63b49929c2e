//! Cadence Pipeline - the scheduled refresh controller
//!
//! Provides:
//! - Stage execution with pre/postconditions, timeouts and streamed output
//! - The version gate (record, diff, push, commit only on change)
//! - The pipeline state machine from sync to publish
//! - `cadence.toml` configuration and the JSON run report

pub mod config;
pub mod context;
pub mod gate;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stage;

// Re-export key types
pub use config::{ConfigError, PipelineConfig, DEFAULT_CONFIG_FILE};
pub use context::{RunContext, RunLog};
pub use gate::{ArtifactSpec, GateError, GateOutcome, VersionGate};
pub use pipeline::{
    PipelineController, PipelinePlan, PipelineState, PlanError, StandardStages, Step, Transition,
};
pub use report::{read_run_report, write_run_report};
pub use runner::{StageError, StageExecutor};
pub use stage::{BuiltinStage, Condition, Invocation, Stage};
