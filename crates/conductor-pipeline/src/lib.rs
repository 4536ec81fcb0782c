//! Pipeline orchestration engine.
//!
//! This crate implements the Conductor runtime: the orchestrator state machine
//! (sequential, parallel, DAG and map modes with decision and loop stages),
//! the condition expression language, the recovery executor, template
//! interpolation, checkpoints for resume, and pipeline validation.

pub mod checkpoint;
pub mod condition;
pub mod config;
pub mod events;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod output_validation;
pub mod recovery;
pub mod template;
pub mod validation;

pub use checkpoint::{
    checkpoint_context, resume_point, CheckpointConfig, CheckpointManager, CheckpointSummary,
    PipelineCheckpoint, StageCheckpoint,
};
pub use condition::{evaluate, parse_expression, try_evaluate, Expr};
pub use config::{load_config, ConductorConfig};
pub use events::{EventEmitter, PipelineEvent};
pub use executor::{AgentExecutor, CommandAgentExecutor, ExecutionMetadata};
pub use graph::topological_order;
pub use orchestrator::{OrchestratorConfig, PipelineOrchestrator, PipelineStatus, RunOptions};
pub use output_validation::{
    CommandSyntaxValidator, DefaultOutputValidator, OutputValidator, SyntaxCheck,
    SyntaxValidator, ValidationOutcome,
};
pub use recovery::RecoveryExecutor;
pub use template::{interpolate, validate_template};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
