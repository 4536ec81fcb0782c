//! Pipeline validation: lint rules and diagnostics.
//!
//! Every structural problem that would make a run meaningless (duplicate ids,
//! unknown dependencies, cycles, unregistered agents, malformed control flow)
//! is reported here so it surfaces before any stage executes. Call
//! [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail on
//! any `Error`-severity issue.

use std::collections::HashSet;

use conductor_types::{
    AgentRegistry, ConditionAction, ConditionOutcome, ConductorError, ExecutionMode, Pipeline,
    PipelineStage, StageType,
};

use crate::condition::parse_expression;
use crate::graph::topological_order;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub stage_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    fn error(rule: &str, stage_id: Option<&str>, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message,
            stage_id: stage_id.map(str::to_string),
            fix: None,
        }
    }

    fn warning(rule: &str, stage_id: Option<&str>, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, stage_id, message)
        }
    }

    fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, pipeline: &Pipeline, agents: &AgentRegistry) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyRule;
impl LintRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        if pipeline.stages.is_empty() {
            vec![Diagnostic::warning(
                self.name(),
                None,
                format!("Pipeline '{}' has no stages", pipeline.name),
            )]
        } else {
            vec![]
        }
    }
}

struct UniqueStageIdsRule;
impl LintRule for UniqueStageIdsRule {
    fn name(&self) -> &str { "unique_stage_ids" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        let mut diags = Vec::new();
        for stage in &pipeline.stages {
            if stage.id.trim().is_empty() {
                diags.push(Diagnostic::error(self.name(), None, "Stage with empty id".into()));
                continue;
            }
            if !seen.insert(stage.id.as_str()) && reported.insert(stage.id.as_str()) {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!("Duplicate stage id '{}'", stage.id),
                    )
                    .with_fix("Give every stage a unique id"),
                );
            }
        }
        diags
    }
}

struct DependencyExistsRule;
impl LintRule for DependencyExistsRule {
    fn name(&self) -> &str { "dependency_exists" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        let ids: HashSet<&str> = pipeline.stages.iter().map(|s| s.id.as_str()).collect();
        let mut diags = Vec::new();
        for stage in &pipeline.stages {
            for dep in &stage.dependencies {
                if !ids.contains(dep.as_str()) {
                    diags.push(Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!("Stage '{}' depends on unknown stage '{dep}'", stage.id),
                    ));
                }
            }
        }
        diags
    }
}

struct AcyclicRule;
impl LintRule for AcyclicRule {
    fn name(&self) -> &str { "acyclic" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        match topological_order(pipeline) {
            Ok(_) => vec![],
            Err(cycle) => vec![Diagnostic::error(
                self.name(),
                cycle.first().map(String::as_str),
                format!("Dependency cycle detected: {}", cycle.join(" -> ")),
            )
            .with_fix("Remove one of the dependencies forming the cycle")],
        }
    }
}

struct AgentRegisteredRule;
impl LintRule for AgentRegisteredRule {
    fn name(&self) -> &str { "agent_registered" }
    fn apply(&self, pipeline: &Pipeline, agents: &AgentRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for stage in pipeline.stages.iter().filter(|s| s.stage_type == StageType::Execution) {
            match stage.agent_name() {
                None => diags.push(Diagnostic::error(
                    self.name(),
                    Some(&stage.id),
                    format!("Execution stage '{}' has no agent", stage.id),
                )),
                Some(name) if !agents.contains(name) => diags.push(
                    Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!("Stage '{}' references unknown agent '{name}'", stage.id),
                    )
                    .with_fix(format!("Register agent '{name}' in the configuration")),
                ),
                Some(_) => {}
            }
        }
        diags
    }
}

struct FallbackAgentsRule;
impl LintRule for FallbackAgentsRule {
    fn name(&self) -> &str { "fallback_agents" }
    fn apply(&self, pipeline: &Pipeline, agents: &AgentRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for stage in &pipeline.stages {
            let Some(recovery) = &stage.recovery else { continue };
            for name in recovery.fallback_agents.iter().filter(|n| !agents.contains(n)) {
                diags.push(Diagnostic::warning(
                    self.name(),
                    Some(&stage.id),
                    format!("Stage '{}' lists unknown fallback agent '{name}'", stage.id),
                ));
            }
        }
        diags
    }
}

struct StageShapeRule;
impl LintRule for StageShapeRule {
    fn name(&self) -> &str { "stage_shape" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for stage in &pipeline.stages {
            match stage.stage_type {
                StageType::Decision if stage.condition.is_none() => {
                    diags.push(Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!("Decision stage '{}' has no condition", stage.id),
                    ));
                }
                StageType::Loop if stage.loop_config.is_none() => {
                    diags.push(Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!("Loop stage '{}' has no loop configuration", stage.id),
                    ));
                }
                _ => {}
            }
        }
        diags
    }
}

struct ControlFlowTargetRule;

impl ControlFlowTargetRule {
    fn check_outcome(
        &self,
        stage: &PipelineStage,
        outcome: &ConditionOutcome,
        ids: &HashSet<&str>,
        diags: &mut Vec<Diagnostic>,
    ) {
        if outcome.action != ConditionAction::Goto {
            return;
        }
        match outcome.target_stage_id.as_deref() {
            None => diags.push(Diagnostic::error(
                self.name(),
                Some(&stage.id),
                format!("Decision stage '{}' has a goto without a target", stage.id),
            )),
            Some(target) if !ids.contains(target) => diags.push(Diagnostic::error(
                self.name(),
                Some(&stage.id),
                format!("Decision stage '{}' jumps to unknown stage '{target}'", stage.id),
            )),
            Some(_) => {}
        }
    }
}

impl LintRule for ControlFlowTargetRule {
    fn name(&self) -> &str { "control_flow_target" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        let ids: HashSet<&str> = pipeline.stages.iter().map(|s| s.id.as_str()).collect();
        let mut diags = Vec::new();
        for stage in &pipeline.stages {
            if let Some(condition) = &stage.condition {
                self.check_outcome(stage, &condition.on_true, &ids, &mut diags);
                self.check_outcome(stage, &condition.on_false, &ids, &mut diags);
            }
            if let Some(config) = &stage.loop_config {
                if config.target_stage_id == stage.id {
                    diags.push(Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!("Loop stage '{}' cannot target itself", stage.id),
                    ));
                } else if !ids.contains(config.target_stage_id.as_str()) {
                    diags.push(Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!(
                            "Loop stage '{}' targets unknown stage '{}'",
                            stage.id, config.target_stage_id
                        ),
                    ));
                } else if pipeline
                    .stage(&config.target_stage_id)
                    .is_some_and(|t| t.stage_type != StageType::Execution)
                {
                    diags.push(Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!(
                            "Loop stage '{}' must target an execution stage, '{}' is not one",
                            stage.id, config.target_stage_id
                        ),
                    ));
                }
            }
        }
        diags
    }
}

struct ModeCompatibilityRule;
impl LintRule for ModeCompatibilityRule {
    fn name(&self) -> &str { "mode_compatibility" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        if !matches!(
            pipeline.execution_mode,
            ExecutionMode::Parallel | ExecutionMode::Dag
        ) {
            return vec![];
        }
        pipeline
            .stages
            .iter()
            .filter(|s| s.stage_type != StageType::Execution)
            .map(|s| {
                Diagnostic::error(
                    self.name(),
                    Some(&s.id),
                    format!(
                        "Stage '{}' is a control-flow stage, which {} pipelines do not support",
                        s.id, pipeline.execution_mode
                    ),
                )
                .with_fix("Use sequential or map execution for decision and loop stages")
            })
            .collect()
    }
}

struct FanoutRule;
impl LintRule for FanoutRule {
    fn name(&self) -> &str { "fanout" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        let fanouts: Vec<&PipelineStage> =
            pipeline.stages.iter().filter(|s| s.fanout.is_some()).collect();
        let mut diags = Vec::new();
        if pipeline.execution_mode == ExecutionMode::Map {
            if fanouts.len() != 1 {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        None,
                        format!(
                            "Map pipeline '{}' needs exactly one fan-out stage, found {}",
                            pipeline.name,
                            fanouts.len()
                        ),
                    )
                    .with_fix("Add a `fanout` block to the stage where per-item work starts"),
                );
            }
            for stage in &fanouts {
                if stage.fanout.as_ref().is_some_and(|f| f.source.trim().is_empty()) {
                    diags.push(Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!("Fan-out stage '{}' has an empty source key", stage.id),
                    ));
                }
            }
        } else {
            for stage in fanouts {
                diags.push(Diagnostic::warning(
                    self.name(),
                    Some(&stage.id),
                    format!(
                        "Stage '{}' declares a fan-out that {} pipelines ignore",
                        stage.id, pipeline.execution_mode
                    ),
                ));
            }
        }
        diags
    }
}

struct MapBoundaryRule;
impl LintRule for MapBoundaryRule {
    fn name(&self) -> &str { "map_boundary" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        if pipeline.execution_mode != ExecutionMode::Map {
            return vec![];
        }
        let Some(fanout) = pipeline.stages.iter().position(|s| s.fanout.is_some()) else {
            return vec![];
        };
        let mut diags = Vec::new();
        for (index, stage) in pipeline.stages.iter().enumerate() {
            let targets = stage
                .condition
                .iter()
                .flat_map(|c| [&c.on_true, &c.on_false])
                .filter(|o| o.action == ConditionAction::Goto)
                .filter_map(|o| o.target_stage_id.as_deref())
                .chain(stage.loop_config.iter().map(|l| l.target_stage_id.as_str()));
            for target in targets {
                let Some(target_index) = pipeline.stage_index(target) else { continue };
                if (index >= fanout) != (target_index >= fanout) {
                    diags.push(Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!(
                            "Stage '{}' targets '{target}' across the fan-out boundary",
                            stage.id
                        ),
                    ));
                }
            }
        }
        diags
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str { "condition_syntax" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for stage in &pipeline.stages {
            let expressions = stage
                .condition
                .iter()
                .map(|c| c.expression.as_str())
                .chain(
                    stage
                        .loop_config
                        .iter()
                        .filter_map(|l| l.until_expression.as_deref()),
                );
            for expression in expressions {
                if let Err(e) = parse_expression(expression) {
                    diags.push(Diagnostic::error(
                        self.name(),
                        Some(&stage.id),
                        format!("Stage '{}' has an invalid expression '{expression}': {e}", stage.id),
                    ));
                }
            }
        }
        diags
    }
}

struct TimeoutRule;
impl LintRule for TimeoutRule {
    fn name(&self) -> &str { "timeout" }
    fn apply(&self, pipeline: &Pipeline, _agents: &AgentRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        if pipeline.timeout_ms == Some(0) {
            diags.push(Diagnostic::error(
                self.name(),
                None,
                format!("Pipeline '{}' has a zero timeout", pipeline.name),
            ));
        }
        for stage in pipeline.stages.iter().filter(|s| s.timeout_ms == Some(0)) {
            diags.push(Diagnostic::error(
                self.name(),
                Some(&stage.id),
                format!("Stage '{}' has a zero timeout", stage.id),
            ));
        }
        diags
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(pipeline: &Pipeline, agents: &AgentRegistry) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(NonEmptyRule),
        Box::new(UniqueStageIdsRule),
        Box::new(DependencyExistsRule),
        Box::new(AcyclicRule),
        Box::new(AgentRegisteredRule),
        Box::new(FallbackAgentsRule),
        Box::new(StageShapeRule),
        Box::new(ControlFlowTargetRule),
        Box::new(ModeCompatibilityRule),
        Box::new(FanoutRule),
        Box::new(MapBoundaryRule),
        Box::new(ConditionSyntaxRule),
        Box::new(TimeoutRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(pipeline, agents));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(
    pipeline: &Pipeline,
    agents: &AgentRegistry,
) -> conductor_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(pipeline, agents);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(ConductorError::ValidationError(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
