//! Pipeline lifecycle events.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, dashboards, the CLI) can follow a run without
//! coupling to the orchestrator internals.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use conductor_types::{AgentResult, AggregatedResult};

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        run_id: String,
        name: String,
    },
    StageStarted {
        stage_id: String,
        run_id: String,
    },
    StageCompleted {
        stage_id: String,
        run_id: String,
        result: AgentResult,
    },
    StageFailed {
        stage_id: String,
        run_id: String,
        error: String,
    },
    StageRetrying {
        stage_id: String,
        run_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    DecisionEvaluated {
        stage_id: String,
        run_id: String,
        expression: String,
        outcome: bool,
    },
    CheckpointSaved {
        run_id: String,
        path: PathBuf,
    },
    PipelineCompleted {
        run_id: String,
        result: AggregatedResult,
    },
    PipelineFailed {
        run_id: String,
        error: String,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> &str {
        match self {
            PipelineEvent::PipelineStarted { run_id, .. }
            | PipelineEvent::StageStarted { run_id, .. }
            | PipelineEvent::StageCompleted { run_id, .. }
            | PipelineEvent::StageFailed { run_id, .. }
            | PipelineEvent::StageRetrying { run_id, .. }
            | PipelineEvent::DecisionEvaluated { run_id, .. }
            | PipelineEvent::CheckpointSaved { run_id, .. }
            | PipelineEvent::PipelineCompleted { run_id, .. }
            | PipelineEvent::PipelineFailed { run_id, .. } => run_id,
        }
    }
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PipelineEvent::PipelineStarted {
            run_id: "run-1".into(),
            name: "review".into(),
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::PipelineStarted { run_id, name } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(name, "review");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(PipelineEvent::StageRetrying {
            stage_id: "build".into(),
            run_id: "run-1".into(),
            attempt: 2,
            delay_ms: 100,
        });

        let json1 = serde_json::to_string(&rx1.recv().await.unwrap()).unwrap();
        let json2 = serde_json::to_string(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(PipelineEvent::PipelineFailed {
            run_id: "run-1".into(),
            error: "something went wrong".into(),
        });
    }

    #[test]
    fn stage_completed_serializes_result() {
        let event = PipelineEvent::StageCompleted {
            stage_id: "lint".into(),
            run_id: "run-7".into(),
            result: AgentResult::success("linter", "clean").with_duration(12),
        };
        assert_eq!(event.run_id(), "run-7");

        let json = serde_json::to_string(&event).unwrap();
        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        match back {
            PipelineEvent::StageCompleted { result, .. } => {
                assert_eq!(result.output.as_deref(), Some("clean"));
                assert_eq!(result.duration_ms, 12);
            }
            other => panic!("unexpected variant after round-trip: {:?}", other),
        }
    }
}
