//! Run state and reconstruction from events.
//!
//! A `PipelineRun` is one execution of a linear tool chain over an
//! immutable set of uploaded files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::pipeline::Pipeline;

use super::events::{Event, EventDetail, EventType, StepStatus};

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// The pipeline being executed
    pub pipeline: Pipeline,

    /// Files uploaded at creation time, in upload order. Never mutated.
    pub original_inputs: Vec<PathBuf>,

    /// Current state of the run
    pub state: RunState,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// One entry per pipeline step, in execution order
    pub steps: Vec<PipelineStep>,
}

/// One tool invocation within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    /// 1-based position; defines execution order
    pub index: usize,

    /// Tool name as registered
    pub tool: String,

    pub status: StepStatus,

    /// Inputs resolved just before execution (empty until then)
    pub inputs: Vec<PathBuf>,

    /// Unique per-step output directory (set when the step starts)
    pub output_dir: Option<PathBuf>,

    /// Files collected from `output_dir` after the verdict
    pub outputs: Vec<PathBuf>,

    /// Execution record, absent until the step finishes
    pub result: Option<StepResult>,
}

/// What happened when a step ran
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Exit code of the final attempt (`None` if the process never started)
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub attempts: u32,

    /// Classification reasoning, kept for diagnosis
    pub reason: String,

    /// Captured output (tail-preserved) on disk
    pub log_path: Option<PathBuf>,
}

impl PipelineStep {
    pub fn new(index: usize, tool: impl Into<String>) -> Self {
        Self {
            index,
            tool: tool.into(),
            status: StepStatus::Pending,
            inputs: Vec::new(),
            output_dir: None,
            outputs: Vec::new(),
            result: None,
        }
    }

    /// Whether every recorded output still exists on disk
    pub fn outputs_present(&self) -> bool {
        self.outputs.iter().all(|p| p.exists())
    }

    /// A step whose results may be reused by a rerun
    pub fn is_reusable(&self) -> bool {
        matches!(self.status, StepStatus::Succeeded | StepStatus::Ambiguous) && self.outputs_present()
    }

    fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.inputs.clear();
        self.outputs.clear();
        self.result = None;
    }
}

impl PipelineRun {
    /// Create a new run for a pipeline
    pub fn new(id: Uuid, pipeline: Pipeline, original_inputs: Vec<PathBuf>) -> Self {
        let steps = pipeline
            .steps
            .iter()
            .enumerate()
            .map(|(i, spec)| PipelineStep::new(i + 1, spec.tool.clone()))
            .collect();

        Self {
            id,
            pipeline,
            original_inputs,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            steps,
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let (pipeline, original_inputs) = match &first.detail {
            Some(EventDetail::Run {
                pipeline,
                original_inputs,
            }) if first.event_type == EventType::RunStarted => {
                (pipeline.clone(), original_inputs.clone())
            }
            _ => return None,
        };

        let mut run = Self::new(first.run_id, pipeline, original_inputs);
        run.started_at = first.timestamp;

        for event in &events[1..] {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
            }
            EventType::RunRestarted => {
                self.state = RunState::Running;
                self.completed_at = None;
                if let Some(EventDetail::Restart { from_step }) = &event.detail {
                    for step in self.steps.iter_mut().filter(|s| s.index >= *from_step) {
                        step.reset();
                    }
                }
            }
            EventType::RunCompleted => {
                self.state = self.derive_completion_state();
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.state = RunState::Cancelled;
                self.completed_at = Some(event.timestamp);
            }
            EventType::SafetyLimitReached => {
                self.state = RunState::SafetyLimitReached {
                    limit: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::StepStarted => {
                if let Some(step) = self.step_mut(event.step_index) {
                    step.status = StepStatus::Running;
                    if let Some(EventDetail::StepInputs {
                        inputs, output_dir, ..
                    }) = &event.detail
                    {
                        step.inputs = inputs.clone();
                        step.output_dir = Some(output_dir.clone());
                    }
                }
            }
            EventType::StepRetrying => {
                if let Some(step) = self.step_mut(event.step_index) {
                    step.status = StepStatus::Running;
                }
            }
            EventType::StepFinished => {
                if let Some(step) = self.step_mut(event.step_index) {
                    step.status = event.status;
                    if let Some(EventDetail::StepOutcome {
                        reason,
                        exit_code,
                        timed_out,
                        attempts,
                        outputs,
                        log_path,
                        ..
                    }) = &event.detail
                    {
                        step.outputs = outputs.clone();
                        step.result = Some(StepResult {
                            exit_code: *exit_code,
                            duration_ms: event.duration_ms.unwrap_or(0),
                            timed_out: *timed_out,
                            attempts: *attempts,
                            reason: reason.clone(),
                            log_path: log_path.clone(),
                        });
                    }
                }
            }
        }
    }

    fn step_mut(&mut self, index: Option<usize>) -> Option<&mut PipelineStep> {
        let index = index?;
        self.steps.iter_mut().find(|s| s.index == index)
    }

    pub fn step(&self, index: usize) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.index == index)
    }

    /// Terminal state for a run whose steps all ran without a halt
    pub fn derive_completion_state(&self) -> RunState {
        let failed: Vec<usize> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.index)
            .collect();
        if !failed.is_empty() {
            return RunState::Failed {
                error: format!("{} step(s) failed: {:?}", failed.len(), failed),
            };
        }

        let flagged = self.flagged_for_review();
        if flagged.is_empty() {
            RunState::Succeeded
        } else {
            RunState::NeedsReview { steps: flagged }
        }
    }

    /// Steps whose verdict was ambiguous
    pub fn flagged_for_review(&self) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Ambiguous)
            .map(|s| s.index)
            .collect()
    }

    /// The first step that did not succeed (where a resume would start)
    pub fn first_incomplete_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .find(|s| !s.is_reusable())
            .map(|s| s.index)
    }

    /// Whether the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }
}

/// Output directory name for a step: `step_<k>_<tool>`
pub fn step_dir_name(index: usize, tool: &str) -> String {
    format!("step_{}_{}", index, tool)
}

/// Output directory for a step under a run directory
pub fn step_output_dir(run_dir: &Path, index: usize, tool: &str) -> PathBuf {
    run_dir.join(step_dir_name(index, tool))
}

/// Overall state of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Some step is pending or running
    Running,

    /// Every step succeeded
    Succeeded,

    /// No step failed, but some verdicts were ambiguous
    NeedsReview { steps: Vec<usize> },

    Failed { error: String },

    /// Stopped by the operator between or during steps
    Cancelled,

    SafetyLimitReached { limit: String },
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::NeedsReview { .. } => "needs-review",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
            Self::SafetyLimitReached { .. } => "safety-limit",
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}
