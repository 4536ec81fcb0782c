//! Pipeline orchestrator: drives one run of a [`Pipeline`] to completion.
//!
//! Lifecycle of a run: validate, seed the context, dispatch to the mode
//! handler (sequential, parallel, DAG or map), aggregate. Every stage
//! execution is recorded in the run ledger and checkpointed before the next
//! scheduling decision, so a failed run can always be resumed from disk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use conductor_types::{
    metadata_keys, AgentRegistry, AgentResult, AggregatedResult, ConditionAction, ConductorError,
    ExecutionMode, FailureStrategy, Pipeline, PipelineContext, PipelineStage, RecoveryStrategy,
    Result, StageRecord, StageType, TimeoutPolicy,
};

use crate::checkpoint::{checkpoint_context, resume_point, CheckpointManager, StageCheckpoint};
use crate::condition;
use crate::events::{EventEmitter, PipelineEvent};
use crate::executor::AgentExecutor;
use crate::graph::topological_order;
use crate::output_validation::{DefaultOutputValidator, OutputValidator};
use crate::recovery::RecoveryExecutor;
use crate::template::{interpolate, render_json, ITEM_INDEX_KEY, ITEM_KEY};
use crate::validation::validate_or_raise;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Orchestrator-wide tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound on stage executions per sequential plan. Guards against
    /// GOTO cycles that never exit.
    pub max_steps: usize,
    /// Finished runs whose status stays queryable. Older ones are forgotten
    /// and report [`PipelineStatus::NotFound`].
    pub retained_runs: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            retained_runs: 256,
        }
    }
}

/// Per-run options for [`PipelineOrchestrator::execute_pipeline`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stage id to start from. Earlier stages are taken from `context`.
    pub resume_from: Option<String>,
    /// Seed context. Its id becomes the run id.
    pub context: Option<PipelineContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    NotFound,
    Running,
    Completed,
    Cancelled,
    Failed,
}

struct RunHandle {
    status: PipelineStatus,
    cancel: CancellationToken,
}

/// Live and recently finished runs. Finished runs are evicted oldest first
/// once more than `retain` of them accumulate.
#[derive(Default)]
struct RunRegistry {
    handles: HashMap<String, RunHandle>,
    finished: VecDeque<String>,
}

impl RunRegistry {
    fn start(&mut self, run_id: &str, cancel: CancellationToken) {
        self.finished.retain(|id| id != run_id);
        self.handles.insert(
            run_id.to_string(),
            RunHandle {
                status: PipelineStatus::Running,
                cancel,
            },
        );
    }

    fn finish(&mut self, run_id: &str, status: PipelineStatus, retain: usize) {
        let Some(handle) = self.handles.get_mut(run_id) else {
            return;
        };
        handle.status = status;
        self.finished.push_back(run_id.to_string());
        while self.finished.len() > retain {
            if let Some(old) = self.finished.pop_front() {
                self.handles.remove(&old);
            }
        }
    }

    fn is_running(&self, run_id: &str) -> bool {
        self.handles
            .get(run_id)
            .is_some_and(|h| h.status == PipelineStatus::Running)
    }
}

/// Drives pipeline runs. Cheap to share behind an `Arc`; any number of runs
/// may be in flight at once.
pub struct PipelineOrchestrator {
    executor: Arc<dyn AgentExecutor>,
    agents: Arc<AgentRegistry>,
    validator: Arc<dyn OutputValidator>,
    checkpoints: Option<Arc<CheckpointManager>>,
    events: EventEmitter,
    config: OrchestratorConfig,
    runs: Mutex<RunRegistry>,
}

impl PipelineOrchestrator {
    pub fn new(executor: Arc<dyn AgentExecutor>, agents: AgentRegistry) -> Self {
        Self {
            executor,
            agents: Arc::new(agents),
            validator: Arc::new(DefaultOutputValidator::default()),
            checkpoints: None,
            events: EventEmitter::default(),
            config: OrchestratorConfig::default(),
            runs: Mutex::new(RunRegistry::default()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn OutputValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Persist a checkpoint after every stage.
    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(Arc::new(manager));
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_deref()
    }

    /// Subscribe to lifecycle events of every run.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Execute `pipeline`.
    ///
    /// Configuration problems fail before any stage runs. Pipeline-control
    /// failures (abort, stage or pipeline timeout, cancellation) carry the
    /// partial result of every stage that finished.
    pub async fn execute_pipeline(
        &self,
        pipeline: &Pipeline,
        options: RunOptions,
    ) -> Result<AggregatedResult> {
        validate_or_raise(pipeline, &self.agents)?;

        let start_index = match options.resume_from.as_deref() {
            Some(id) => pipeline.stage_index(id).ok_or_else(|| {
                ConductorError::ValidationError(format!("Unknown resume stage '{id}'"))
            })?,
            None => 0,
        };

        let ctx = match options.context {
            Some(seed) => {
                let id = seed.pipeline_id().to_string();
                seed.rebind(id, &pipeline.name)
            }
            None => PipelineContext::new(uuid::Uuid::new_v4().to_string(), &pipeline.name),
        };
        let run_id = ctx.pipeline_id().to_string();

        let cancel = CancellationToken::new();
        {
            let mut runs = self.runs.lock().await;
            if runs.is_running(&run_id) {
                return Err(ConductorError::ValidationError(format!(
                    "Run '{run_id}' is already in progress"
                )));
            }
            runs.start(&run_id, cancel.clone());
        }

        let run = Run {
            id: run_id.clone(),
            pipeline: Arc::new(pipeline.clone()),
            ctx,
            ledger: Arc::new(Mutex::new(Vec::new())),
            recovery: Arc::new(RecoveryExecutor::new(
                Arc::clone(&self.executor),
                Arc::clone(&self.agents),
                Arc::clone(&self.validator),
                self.events.clone(),
            )),
            checkpoints: self.checkpoints.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            max_steps: self.config.max_steps,
            instance: None,
        };

        tracing::info!(
            run_id = %run_id,
            pipeline = %pipeline.name,
            mode = %pipeline.execution_mode,
            stages = pipeline.stages.len(),
            start = start_index,
            "Starting pipeline"
        );
        self.events.emit(PipelineEvent::PipelineStarted {
            run_id: run_id.clone(),
            name: pipeline.name.clone(),
        });

        let outcome = tokio::select! {
            outcome = run.execute_with_timeout(start_index) => outcome,
            _ = cancel.cancelled() => Err(ConductorError::Cancelled {
                run_id: run_id.clone(),
                partial: run.partial().await,
            }),
        };

        let status = match &outcome {
            Ok(_) => PipelineStatus::Completed,
            Err(ConductorError::Cancelled { .. }) => PipelineStatus::Cancelled,
            Err(_) => PipelineStatus::Failed,
        };
        self.runs
            .lock()
            .await
            .finish(&run_id, status, self.config.retained_runs);

        match outcome {
            Ok(result) => {
                tracing::info!(
                    run_id = %run_id,
                    succeeded = result.success_count,
                    failed = result.failure_count,
                    duration_ms = result.total_duration_ms,
                    "Pipeline completed"
                );
                self.events.emit(PipelineEvent::PipelineCompleted {
                    run_id,
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Pipeline failed");
                self.events.emit(PipelineEvent::PipelineFailed {
                    run_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Resume a checkpointed run.
    ///
    /// Starts at `from_stage` when given, otherwise at the first stage without
    /// a successful checkpoint record. A run whose stages all succeeded
    /// returns its checkpointed result without executing anything.
    pub async fn resume_pipeline(
        &self,
        pipeline: &Pipeline,
        run_id: &str,
        from_stage: Option<&str>,
    ) -> Result<AggregatedResult> {
        let manager = self.checkpoints.as_ref().ok_or_else(|| {
            ConductorError::Other("checkpoints are not configured".into())
        })?;
        let checkpoint = manager.load(run_id).await?.ok_or_else(|| {
            ConductorError::Other(format!("No checkpoint found for run '{run_id}'"))
        })?;
        if checkpoint.pipeline_name != pipeline.name {
            return Err(ConductorError::ValidationError(format!(
                "Checkpoint '{run_id}' belongs to pipeline '{}', not '{}'",
                checkpoint.pipeline_name, pipeline.name
            )));
        }

        let start = match from_stage {
            Some(id) => Some(id.to_string()),
            None => resume_point(pipeline, &checkpoint),
        };
        let Some(start) = start else {
            tracing::info!(run_id, "Every stage already succeeded, nothing to resume");
            let records = checkpoint
                .completed_stages
                .iter()
                .map(|s| StageRecord::new(&s.stage_id, s.to_result()))
                .collect();
            return Ok(AggregatedResult::from_records(records));
        };

        tracing::info!(run_id, from = %start, "Resuming pipeline");
        let context = checkpoint_context(&checkpoint).await;
        self.execute_pipeline(
            pipeline,
            RunOptions {
                resume_from: Some(start),
                context: Some(context),
            },
        )
        .await
    }

    /// Request cooperative cancellation. Returns `false` when the run is not
    /// in progress.
    pub async fn cancel_pipeline(&self, run_id: &str) -> bool {
        let mut runs = self.runs.lock().await;
        match runs.handles.get_mut(run_id) {
            Some(handle) if handle.status == PipelineStatus::Running => {
                handle.cancel.cancel();
                handle.status = PipelineStatus::Cancelled;
                tracing::info!(run_id, "Pipeline cancelled");
                true
            }
            _ => false,
        }
    }

    pub async fn pipeline_status(&self, run_id: &str) -> PipelineStatus {
        self.runs
            .lock()
            .await
            .handles
            .get(run_id)
            .map_or(PipelineStatus::NotFound, |h| h.status)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Identity of one MAP fan-out instance.
struct FanoutInstance {
    index: usize,
    item: String,
}

/// State of one run, cloned into every spawned stage task.
#[derive(Clone)]
struct Run {
    id: String,
    pipeline: Arc<Pipeline>,
    ctx: PipelineContext,
    ledger: Arc<Mutex<Vec<StageRecord>>>,
    recovery: Arc<RecoveryExecutor>,
    checkpoints: Option<Arc<CheckpointManager>>,
    events: EventEmitter,
    cancel: CancellationToken,
    max_steps: usize,
    instance: Option<Arc<FanoutInstance>>,
}

/// Where a sequential plan continues after a control-flow stage.
enum Jump {
    Next,
    To(usize),
}

impl Run {
    async fn execute_with_timeout(&self, start_index: usize) -> Result<AggregatedResult> {
        let dispatch = self.dispatch(start_index);
        let Some(ms) = self.pipeline.timeout_ms else {
            return dispatch.await;
        };

        // The timed-out dispatch future must be dropped before the ledger is
        // read; it may hold the ledger lock.
        let outcome = tokio::time::timeout(Duration::from_millis(ms), dispatch).await;
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(run_id = %self.id, timeout_ms = ms, "Pipeline timed out");
                Err(ConductorError::PipelineTimeout {
                    pipeline: self.pipeline.name.clone(),
                    timeout_ms: ms,
                    partial: self.partial().await,
                })
            }
        }
    }

    async fn dispatch(&self, start_index: usize) -> Result<AggregatedResult> {
        match self.pipeline.execution_mode {
            ExecutionMode::Sequential => {
                let baton = self.seed_ledger(start_index).await;
                self.run_sequence(0..self.pipeline.stages.len(), start_index, baton)
                    .await?;
            }
            ExecutionMode::Parallel => {
                let done = self.seed_successes().await;
                self.run_parallel(done).await?;
            }
            ExecutionMode::Dag => {
                let done = self.seed_successes().await;
                self.run_dag(done).await?;
            }
            ExecutionMode::Map => {
                let baton = self.seed_ledger(start_index).await;
                self.run_map(start_index, baton).await?;
            }
        }
        Ok(AggregatedResult::from_records(self.ledger.lock().await.clone()))
    }

    // -- Seeding ------------------------------------------------------------

    /// Copy seeded results of the stages before `start_index` into the ledger
    /// and return the baton the first executed stage should receive.
    async fn seed_ledger(&self, start_index: usize) -> Option<String> {
        let mut baton = None;
        let mut ledger = self.ledger.lock().await;
        for stage in &self.pipeline.stages[..start_index] {
            if let Some(result) = self.ctx.stage_result(&stage.id).await {
                if result.success {
                    baton = non_empty(result.output.clone()).or(baton);
                } else {
                    baton = None;
                }
                ledger.push(StageRecord::new(&stage.id, result));
            }
        }
        baton
    }

    /// Seeded successes are not executed again in PARALLEL / DAG runs.
    async fn seed_successes(&self) -> HashSet<usize> {
        let mut done = HashSet::new();
        let mut ledger = self.ledger.lock().await;
        for (index, stage) in self.pipeline.stages.iter().enumerate() {
            if let Some(result) = self.ctx.stage_result(&stage.id).await {
                if result.success {
                    done.insert(index);
                    ledger.push(StageRecord::new(&stage.id, result));
                }
            }
        }
        done
    }

    // -- Sequential ---------------------------------------------------------

    /// Run the plan `stages[plan]` in order from `start`, following DECISION
    /// jumps and LOOP repeats. Returns the final baton.
    async fn run_sequence(
        &self,
        plan: std::ops::Range<usize>,
        start: usize,
        mut baton: Option<String>,
    ) -> Result<Option<String>> {
        let mut pc = start;
        let mut steps = 0usize;

        while pc < plan.end {
            self.tick(&mut steps).await?;
            self.ctx.set_current_stage_index(pc).await;
            let stage = &self.pipeline.stages[pc];

            match stage.stage_type {
                StageType::Execution => {
                    let input = self.stage_input(stage).await.or_else(|| baton.clone());
                    let result = self.execute_stage(stage, input, &[]).await?;
                    baton = next_baton(baton, &result);
                    pc += 1;
                }
                StageType::Decision => match self.run_decision(stage).await? {
                    Jump::Next => pc += 1,
                    Jump::To(target) => {
                        if !plan.contains(&target) {
                            return Err(ConductorError::ValidationError(format!(
                                "Decision stage '{}' jumps outside its plan",
                                stage.id
                            )));
                        }
                        tracing::debug!(stage = %stage.id, target = %self.pipeline.stages[target].id, "Jumping");
                        pc = target;
                    }
                },
                StageType::Loop => {
                    baton = self.run_loop(stage, baton, &mut steps).await?;
                    pc += 1;
                }
            }
        }
        Ok(baton)
    }

    async fn tick(&self, steps: &mut usize) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ConductorError::Cancelled {
                run_id: self.id.clone(),
                partial: self.partial().await,
            });
        }
        *steps += 1;
        if *steps > self.max_steps {
            return Err(ConductorError::StepLimitExceeded {
                limit: self.max_steps,
                partial: self.partial().await,
            });
        }
        Ok(())
    }

    async fn run_decision(&self, stage: &PipelineStage) -> Result<Jump> {
        let condition = stage.condition.as_ref().ok_or_else(|| {
            ConductorError::ValidationError(format!("Decision stage '{}' has no condition", stage.id))
        })?;

        self.emit_started(stage);
        let snapshot = self.ctx.snapshot().await;
        let value = condition::evaluate(&condition.expression, &snapshot);
        let outcome = if value {
            &condition.on_true
        } else {
            &condition.on_false
        };
        tracing::info!(
            stage = %stage.id,
            expression = %condition.expression,
            value,
            action = ?outcome.action,
            "Decision evaluated"
        );
        self.events.emit(PipelineEvent::DecisionEvaluated {
            stage_id: self.key_for(&stage.id),
            run_id: self.id.clone(),
            expression: condition.expression.clone(),
            outcome: value,
        });

        self.ctx.apply_shared_state(&outcome.shared_state).await;
        let action = match outcome.action {
            ConditionAction::Continue => "continue",
            ConditionAction::Goto => "goto",
            ConditionAction::Abort => "abort",
        };
        let result = AgentResult::success(format!("decision:{}", stage.id), value.to_string())
            .with_metadata(metadata_keys::DECISION, action);
        self.record(stage, result).await;

        match outcome.action {
            ConditionAction::Continue => Ok(Jump::Next),
            ConditionAction::Goto => {
                let target = outcome.target_stage_id.as_deref().unwrap_or_default();
                self.pipeline.stage_index(target).map(Jump::To).ok_or_else(|| {
                    ConductorError::ValidationError(format!(
                        "Decision stage '{}' jumps to unknown stage '{target}'",
                        stage.id
                    ))
                })
            }
            ConditionAction::Abort => Err(ConductorError::Aborted {
                stage: self.key_for(&stage.id),
                message: outcome.message.clone(),
                partial: self.partial().await,
            }),
        }
    }

    async fn run_loop(
        &self,
        stage: &PipelineStage,
        mut baton: Option<String>,
        steps: &mut usize,
    ) -> Result<Option<String>> {
        let config = stage.loop_config.as_ref().ok_or_else(|| {
            ConductorError::ValidationError(format!("Loop stage '{}' has no loop config", stage.id))
        })?;
        let target = self.pipeline.stage(&config.target_stage_id).ok_or_else(|| {
            ConductorError::ValidationError(format!(
                "Loop stage '{}' targets unknown stage '{}'",
                stage.id, config.target_stage_id
            ))
        })?;

        self.emit_started(stage);
        let mut iterations = 0u32;
        for iteration in 1..=config.max_iterations {
            self.tick(steps).await?;
            let input = self.stage_input(target).await.or_else(|| baton.clone());
            let extra = [
                (metadata_keys::LOOP_ITERATION, iteration.to_string()),
                (metadata_keys::LOOP_CONTROLLER, stage.id.clone()),
            ];
            let result = self.execute_stage(target, input, &extra).await?;
            baton = next_baton(baton, &result);
            iterations = iteration;

            if let Some(until) = &config.until_expression {
                if condition::evaluate(until, &self.ctx.snapshot().await) {
                    tracing::debug!(stage = %stage.id, iteration, "Loop condition met");
                    break;
                }
            }
        }

        tracing::info!(stage = %stage.id, target = %target.id, iterations, "Loop finished");
        let result = AgentResult::success(format!("loop:{}", stage.id), iterations.to_string())
            .with_metadata(metadata_keys::LOOP_ITERATION, iterations);
        self.record(stage, result).await;
        Ok(baton)
    }

    // -- Parallel / DAG -----------------------------------------------------

    async fn run_parallel(&self, done: HashSet<usize>) -> Result<()> {
        let mut set = JoinSet::new();
        for index in (0..self.pipeline.stages.len()).filter(|i| !done.contains(i)) {
            let run = self.clone();
            set.spawn(async move {
                let stage = &run.pipeline.stages[index];
                let input = run.stage_input(stage).await;
                run.execute_stage(stage, input, &[]).await.map(|_| ())
            });
        }

        let mut failure = None;
        while let Some(joined) = set.join_next().await {
            if let Err(e) = flatten(joined) {
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Ready-set scheduling: a stage starts once every dependency has a
    /// result. After an abort-worthy failure no new stage starts; in-flight
    /// stages are allowed to finish.
    async fn run_dag(&self, mut done: HashSet<usize>) -> Result<()> {
        let order = topological_order(&self.pipeline).map_err(|cycle| {
            ConductorError::ValidationError(format!(
                "Dependency cycle detected: {}",
                cycle.join(" -> ")
            ))
        })?;
        let index: HashMap<&str, usize> = self
            .pipeline
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut pending: Vec<usize> = order.into_iter().filter(|i| !done.contains(i)).collect();
        let mut set = JoinSet::new();
        let mut failure: Option<ConductorError> = None;

        loop {
            if failure.is_none() {
                let mut waiting = Vec::with_capacity(pending.len());
                for stage_index in pending.drain(..) {
                    let stage = &self.pipeline.stages[stage_index];
                    let ready = stage
                        .dependencies
                        .iter()
                        .filter_map(|d| index.get(d.as_str()))
                        .all(|d| done.contains(d));
                    if !ready {
                        waiting.push(stage_index);
                        continue;
                    }
                    let run = self.clone();
                    set.spawn(async move {
                        let stage = &run.pipeline.stages[stage_index];
                        let input = match run.stage_input(stage).await {
                            Some(input) => Some(input),
                            None => run.dependency_input(stage).await,
                        };
                        let outcome = run.execute_stage(stage, input, &[]).await.map(|_| ());
                        (stage_index, outcome)
                    });
                }
                pending = waiting;
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            match joined {
                Ok((stage_index, outcome)) => {
                    done.insert(stage_index);
                    if let Err(e) = outcome {
                        failure.get_or_insert(e);
                    }
                }
                Err(e) => {
                    failure.get_or_insert(ConductorError::Other(format!("stage task failed: {e}")));
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if !pending.is_empty() {
            let ids: Vec<&str> = pending
                .iter()
                .map(|&i| self.pipeline.stages[i].id.as_str())
                .collect();
            return Err(ConductorError::Other(format!(
                "stages never became ready: {}",
                ids.join(", ")
            )));
        }
        Ok(())
    }

    async fn dependency_input(&self, stage: &PipelineStage) -> Option<String> {
        let mut outputs = Vec::new();
        for dep in &stage.dependencies {
            if let Some(output) = self.ctx.stage_output(dep).await {
                outputs.push(output);
            }
        }
        if outputs.is_empty() {
            None
        } else {
            Some(outputs.join("\n"))
        }
    }

    // -- Map ----------------------------------------------------------------

    async fn run_map(&self, start_index: usize, baton: Option<String>) -> Result<()> {
        let stages = &self.pipeline.stages;
        let fanout_index = stages
            .iter()
            .position(|s| s.fanout.is_some())
            .ok_or_else(|| {
                ConductorError::ValidationError(format!(
                    "Map pipeline '{}' has no fan-out stage",
                    self.pipeline.name
                ))
            })?;

        let baton = if start_index < fanout_index {
            self.run_sequence(0..fanout_index, start_index, baton).await?
        } else {
            baton
        };

        let source = stages[fanout_index]
            .fanout
            .as_ref()
            .map(|f| f.source.clone())
            .unwrap_or_default();
        let items = match self.ctx.get_shared(&source).await {
            Some(serde_json::Value::Array(items)) => items,
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(single) => vec![single],
        };
        if items.is_empty() {
            tracing::warn!(run_id = %self.id, source = %source, "Fan-out source is empty, nothing to map");
            return Ok(());
        }

        tracing::info!(run_id = %self.id, source = %source, items = items.len(), "Fanning out");
        let mut set = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let ctx = self.ctx.clone_isolated().await;
            ctx.set_shared(ITEM_KEY, item.clone()).await;
            ctx.set_shared(ITEM_INDEX_KEY, serde_json::json!(index)).await;
            let rendered = render_json(&item);
            let run = Run {
                ctx,
                instance: Some(Arc::new(FanoutInstance {
                    index,
                    item: rendered.clone(),
                })),
                ..self.clone()
            };
            let instance_baton = non_empty(Some(rendered)).or_else(|| baton.clone());
            let end = stages.len();
            set.spawn(async move {
                run.run_sequence(fanout_index..end, fanout_index, instance_baton)
                    .await
                    .map(|_| ())
            });
        }

        let mut failure = None;
        while let Some(joined) = set.join_next().await {
            if let Err(e) = flatten(joined) {
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    // -- Stage execution ----------------------------------------------------

    /// Templated static input of a stage.
    async fn stage_input(&self, stage: &PipelineStage) -> Option<String> {
        let template = stage.input.as_deref()?;
        Some(interpolate(template, &self.ctx.snapshot().await))
    }

    /// Execute, record and check one EXECUTION stage.
    async fn execute_stage(
        &self,
        stage: &PipelineStage,
        input: Option<String>,
        extra: &[(&str, String)],
    ) -> Result<AgentResult> {
        let (mut result, timed_out) = self.invoke(stage, input).await;
        for (key, value) in extra {
            result = result.with_metadata(*key, value);
        }
        self.record(stage, result.clone()).await;
        self.check_failure(stage, &result, timed_out).await?;
        Ok(result)
    }

    /// Run the stage through the recovery executor under its timeout.
    /// Exceptional executor errors become failed results.
    async fn invoke(&self, stage: &PipelineStage, input: Option<String>) -> (AgentResult, bool) {
        self.emit_started(stage);
        let agent_name = stage.agent_name().unwrap_or(&stage.id).to_string();
        let started = tokio::time::Instant::now();
        let call = self
            .recovery
            .execute_with_recovery(stage, input.as_deref(), &self.ctx);

        let outcome = match stage.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(stage = %stage.id, timeout_ms = ms, policy = ?stage.timeout_policy, "Stage timed out");
                    let result = AgentResult::failure(
                        agent_name,
                        format!("Stage '{}' timed out after {ms} ms", stage.id),
                    )
                    .with_duration(started.elapsed().as_millis() as u64)
                    .with_metadata(metadata_keys::TIMED_OUT, true);
                    return (result, true);
                }
            },
            None => call.await,
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(mut result) => {
                if result.duration_ms == 0 {
                    result.duration_ms = elapsed;
                }
                (result, false)
            }
            Err(e) => {
                tracing::warn!(stage = %stage.id, error = %e, "Stage raised an error");
                (AgentResult::failure(agent_name, e.to_string()).with_duration(elapsed), false)
            }
        }
    }

    /// Store a stage result in the context and the ledger, emit the matching
    /// event and checkpoint the run.
    async fn record(&self, stage: &PipelineStage, result: AgentResult) {
        let key = self.key_for(&stage.id);
        let result = match &self.instance {
            Some(instance) => result
                .with_metadata(metadata_keys::FANOUT_INDEX, instance.index)
                .with_metadata(metadata_keys::FANOUT_ITEM, &instance.item),
            None => result,
        };

        self.ctx.add_stage_result(&stage.id, result.clone()).await;
        if result.success {
            tracing::debug!(stage = %key, agent = %result.agent_name, duration_ms = result.duration_ms, "Stage completed");
            self.events.emit(PipelineEvent::StageCompleted {
                stage_id: key.clone(),
                run_id: self.id.clone(),
                result: result.clone(),
            });
        } else {
            let error = result.error.clone().unwrap_or_else(|| "stage failed".into());
            tracing::warn!(stage = %key, agent = %result.agent_name, error = %error, "Stage failed");
            self.events.emit(PipelineEvent::StageFailed {
                stage_id: key.clone(),
                run_id: self.id.clone(),
                error,
            });
        }

        let mut ledger = self.ledger.lock().await;
        ledger.push(StageRecord::new(key, result));
        let Some(manager) = &self.checkpoints else {
            return;
        };
        let stages = StageCheckpoint::from_records(&ledger);
        match manager.save(&self.id, &self.pipeline.name, stages).await {
            Ok(path) => self.events.emit(PipelineEvent::CheckpointSaved {
                run_id: self.id.clone(),
                path,
            }),
            Err(e) => tracing::warn!(run_id = %self.id, error = %e, "Failed to save checkpoint"),
        }
    }

    async fn check_failure(
        &self,
        stage: &PipelineStage,
        result: &AgentResult,
        timed_out: bool,
    ) -> Result<()> {
        if result.success {
            return Ok(());
        }
        if timed_out {
            return match stage.timeout_policy {
                TimeoutPolicy::SkipStageAndContinue => Ok(()),
                TimeoutPolicy::FailPipeline => Err(ConductorError::StageTimeout {
                    stage: self.key_for(&stage.id),
                    timeout_ms: stage.timeout_ms.unwrap_or_default(),
                    partial: self.partial().await,
                }),
            };
        }

        let optional = stage.optional
            || stage
                .recovery
                .as_ref()
                .is_some_and(|r| r.strategy == RecoveryStrategy::Skip);
        let strategy = stage.effective_failure_strategy(self.pipeline.failure_strategy);
        if optional || strategy == FailureStrategy::Continue {
            return Ok(());
        }
        Err(ConductorError::StageFailed {
            stage: self.key_for(&stage.id),
            message: result
                .error
                .clone()
                .unwrap_or_else(|| "stage failed".into()),
            partial: self.partial().await,
        })
    }

    // -- Helpers ------------------------------------------------------------

    fn key_for(&self, stage_id: &str) -> String {
        match &self.instance {
            Some(instance) => format!("{stage_id}[{}]", instance.index),
            None => stage_id.to_string(),
        }
    }

    fn emit_started(&self, stage: &PipelineStage) {
        self.events.emit(PipelineEvent::StageStarted {
            stage_id: self.key_for(&stage.id),
            run_id: self.id.clone(),
        });
    }

    async fn partial(&self) -> Box<AggregatedResult> {
        Box::new(AggregatedResult::from_records(self.ledger.lock().await.clone()))
    }
}

fn non_empty(output: Option<String>) -> Option<String> {
    output.filter(|o| !o.trim().is_empty())
}

/// Baton after a stage: a successful non-blank output replaces it, a blank
/// success keeps it and a failure clears it.
fn next_baton(current: Option<String>, result: &AgentResult) -> Option<String> {
    if result.success {
        non_empty(result.output.clone()).or(current)
    } else {
        None
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| ConductorError::Other(format!("stage task failed: {e}")))?
}
