//! Declarative pipeline definition: pipelines, stages, and the per-stage
//! recovery, validation, condition, loop, and fan-out configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
    Dag,
    Map,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Dag => "dag",
            ExecutionMode::Map => "map",
        };
        f.write_str(s)
    }
}

/// What happens to the run when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    #[default]
    Abort,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    #[default]
    Execution,
    Decision,
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    #[default]
    FailPipeline,
    SkipStageAndContinue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    #[default]
    Retry,
    Fallback,
    RetryThenFallback,
    Skip,
    Abort,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::RetryThenFallback => "retry_then_fallback",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Abort => "abort",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionAction {
    #[default]
    Continue,
    Goto,
    Abort,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

fn default_agent_timeout_ms() -> u64 {
    30_000
}

/// An external command that consumes stage input on stdin and produces output
/// on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_agent_timeout_ms")]
    pub timeout_ms: u64,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            environment: BTreeMap::new(),
            working_dir: None,
            timeout_ms: default_agent_timeout_ms(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Reference from a stage to a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReference {
    pub name: String,
}

impl AgentReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Agents known to an orchestrator, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentConfig>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any previous agent with the same name.
    pub fn register(&mut self, agent: AgentConfig) {
        self.agents.insert(agent.name.clone(), agent);
    }

    pub fn get(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl FromIterator<AgentConfig> for AgentRegistry {
    fn from_iter<T: IntoIterator<Item = AgentConfig>>(iter: T) -> Self {
        let mut registry = AgentRegistry::new();
        for agent in iter {
            registry.register(agent);
        }
        registry
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub strategy: RecoveryStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Error substrings that make a failure retryable. Empty means no
    /// failure is retried.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
    #[serde(default)]
    pub fallback_agents: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            strategy: RecoveryStrategy::default(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_strategy: BackoffStrategy::default(),
            retryable_errors: Vec::new(),
            fallback_agents: Vec::new(),
        }
    }
}

impl RecoveryConfig {
    /// Whether a failure message qualifies for another attempt.
    pub fn is_retryable(&self, error: &str) -> bool {
        if error.trim().is_empty() {
            return false;
        }
        let lowered = error.to_lowercase();
        self.retryable_errors
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()))
    }
}

// ---------------------------------------------------------------------------
// Output validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomValidatorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageValidationConfig {
    #[serde(default)]
    pub requires_file: Option<String>,
    #[serde(default)]
    pub requires_code_block: bool,
    #[serde(default)]
    pub min_length: usize,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub required_keywords: Vec<String>,
    #[serde(default)]
    pub forbidden_keywords: Vec<String>,
    #[serde(default)]
    pub min_quality_score: f64,
    #[serde(default)]
    pub custom_validators: Vec<CustomValidatorConfig>,
}

// ---------------------------------------------------------------------------
// Decision / loop / fan-out
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConditionOutcome {
    #[serde(default)]
    pub action: ConditionAction,
    #[serde(default)]
    pub target_stage_id: Option<String>,
    #[serde(default)]
    pub shared_state: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ConditionOutcome {
    pub fn goto(target: impl Into<String>) -> Self {
        Self {
            action: ConditionAction::Goto,
            target_stage_id: Some(target.into()),
            ..Default::default()
        }
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self {
            action: ConditionAction::Abort,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConditionConfig {
    pub expression: String,
    #[serde(default)]
    pub on_true: ConditionOutcome,
    #[serde(default)]
    pub on_false: ConditionOutcome,
}

fn default_max_iterations() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLoopConfig {
    pub target_stage_id: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub until_expression: Option<String>,
}

/// Marks the stage at which a MAP pipeline fans out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Shared-state key holding the items.
    pub source: String,
}

// ---------------------------------------------------------------------------
// Stage / Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: String,
    #[serde(rename = "type", default)]
    pub stage_type: StageType,
    #[serde(default)]
    pub agent: Option<AgentReference>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Overrides the pipeline-level failure strategy.
    #[serde(default)]
    pub failure_strategy: Option<FailureStrategy>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub recovery: Option<RecoveryConfig>,
    #[serde(default)]
    pub validation: Option<StageValidationConfig>,
    #[serde(default)]
    pub condition: Option<StageConditionConfig>,
    #[serde(rename = "loop", default)]
    pub loop_config: Option<StageLoopConfig>,
    #[serde(default)]
    pub fanout: Option<FanoutConfig>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
}

impl PipelineStage {
    /// An EXECUTION stage bound to `agent`.
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            agent: Some(AgentReference::new(agent)),
            ..Self::bare(id, StageType::Execution)
        }
    }

    pub fn decision(id: impl Into<String>, condition: StageConditionConfig) -> Self {
        Self {
            condition: Some(condition),
            ..Self::bare(id, StageType::Decision)
        }
    }

    pub fn looping(id: impl Into<String>, config: StageLoopConfig) -> Self {
        Self {
            loop_config: Some(config),
            ..Self::bare(id, StageType::Loop)
        }
    }

    fn bare(id: impl Into<String>, stage_type: StageType) -> Self {
        Self {
            id: id.into(),
            stage_type,
            agent: None,
            input: None,
            dependencies: Vec::new(),
            failure_strategy: None,
            optional: false,
            recovery: None,
            validation: None,
            condition: None,
            loop_config: None,
            fanout: None,
            timeout_ms: None,
            timeout_policy: TimeoutPolicy::default(),
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_validation(mut self, validation: StageValidationConfig) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = Some(strategy);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64, policy: TimeoutPolicy) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self.timeout_policy = policy;
        self
    }

    pub fn with_fanout(mut self, source: impl Into<String>) -> Self {
        self.fanout = Some(FanoutConfig {
            source: source.into(),
        });
        self
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.agent.as_ref().map(|a| a.name.as_str())
    }

    /// Failure strategy in effect, taking the pipeline default into account.
    pub fn effective_failure_strategy(&self, pipeline_default: FailureStrategy) -> FailureStrategy {
        self.failure_strategy.unwrap_or(pipeline_default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, mode: ExecutionMode, stages: Vec<PipelineStage>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            execution_mode: mode,
            stages,
            timeout_ms: None,
            failure_strategy: FailureStrategy::default(),
        }
    }

    pub fn stage(&self, id: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_index(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }
}
