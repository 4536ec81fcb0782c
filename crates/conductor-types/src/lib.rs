//! Shared types, errors, pipeline model, and run context for the Conductor engine.
//!
//! This crate provides the foundational types used across all other Conductor crates:
//! - `ConductorError`: unified error taxonomy
//! - `AgentResult` / `AggregatedResult`: per-stage and per-run outcomes
//! - `Pipeline` and friends: the declarative pipeline definition
//! - `PipelineContext`: thread-safe per-run state shared by stage tasks

pub mod context;
pub mod model;
pub mod result;

pub use context::{ContextSnapshot, PipelineContext};
pub use model::{
    AgentConfig, AgentReference, AgentRegistry, BackoffStrategy, ConditionAction,
    ConditionOutcome, CustomValidatorConfig, ExecutionMode, FailureStrategy, FanoutConfig,
    Pipeline, PipelineStage, RecoveryConfig, RecoveryStrategy, StageConditionConfig,
    StageLoopConfig, StageType, StageValidationConfig, TimeoutPolicy,
};
pub use result::{metadata_keys, AgentResult, AggregatedResult, StageRecord};

/// Unified error type for all Conductor subsystems.
///
/// Pipeline-control variants carry the partial [`AggregatedResult`] of the run
/// so a caller can still report every stage that finished before the failure.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    // === Configuration Errors ===
    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error("Agent not found: {agent}")]
    AgentNotFound { agent: String },

    // === Pipeline Control ===
    #[error("Pipeline aborted at stage '{stage}'{}", abort_suffix(.message))]
    Aborted {
        stage: String,
        message: Option<String>,
        partial: Box<AggregatedResult>,
    },

    #[error("Stage '{stage}' failed: {message}")]
    StageFailed {
        stage: String,
        message: String,
        partial: Box<AggregatedResult>,
    },

    #[error("Stage '{stage}' timed out after {timeout_ms} ms")]
    StageTimeout {
        stage: String,
        timeout_ms: u64,
        partial: Box<AggregatedResult>,
    },

    #[error("Pipeline '{pipeline}' timed out after {timeout_ms} ms")]
    PipelineTimeout {
        pipeline: String,
        timeout_ms: u64,
        partial: Box<AggregatedResult>,
    },

    #[error("Pipeline run '{run_id}' was cancelled")]
    Cancelled {
        run_id: String,
        partial: Box<AggregatedResult>,
    },

    #[error("Step limit of {limit} stage executions exceeded")]
    StepLimitExceeded {
        limit: usize,
        partial: Box<AggregatedResult>,
    },

    // === Executor Errors ===
    #[error("Agent '{agent}' execution error: {message}")]
    AgentExecution { agent: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ConductorError {
    /// Returns `true` for errors raised before any stage executed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ConductorError::ValidationError(_) | ConductorError::AgentNotFound { .. }
        )
    }

    /// The partial result carried by pipeline-control errors.
    pub fn partial_result(&self) -> Option<&AggregatedResult> {
        match self {
            ConductorError::Aborted { partial, .. }
            | ConductorError::StageFailed { partial, .. }
            | ConductorError::StageTimeout { partial, .. }
            | ConductorError::PipelineTimeout { partial, .. }
            | ConductorError::Cancelled { partial, .. }
            | ConductorError::StepLimitExceeded { partial, .. } => Some(partial.as_ref()),
            _ => None,
        }
    }

    /// The stage that caused termination, when one is known.
    pub fn stage(&self) -> Option<&str> {
        match self {
            ConductorError::Aborted { stage, .. }
            | ConductorError::StageFailed { stage, .. }
            | ConductorError::StageTimeout { stage, .. } => Some(stage.as_str()),
            _ => None,
        }
    }
}

fn abort_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

/// A convenience alias for `Result<T, ConductorError>`.
pub type Result<T> = std::result::Result<T, ConductorError>;
