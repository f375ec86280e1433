//! One job's walk through its template's stages.

pub mod branch;
pub mod executor;
pub mod machine;
pub mod markers;
pub mod state;

pub use executor::{IterationOutcome, ShellStageExecutor, StageExecutor, StageRequest};
pub use machine::{PlannedStage, RunOptions, RunPlan, StageMachine};
pub use markers::Markers;
pub use state::{PipelineState, RunStatus, StageStatus};
