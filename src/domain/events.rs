//! Event types for the event-sourced sequencer.
//!
//! All state changes are recorded as immutable events in an append-only log.
//! A run's state is rebuilt by replaying its events in order.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::pipeline::Pipeline;
use crate::core::runner::ResourceTier;

use super::summary::IssueKind;

/// A single event in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// 1-based step index (if applicable)
    pub step_index: Option<usize>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{step}:{input_hash}"
    pub idempotency_key: String,

    /// Human-readable summary
    pub payload_summary: String,

    /// Status of the step/run after this event
    pub status: StepStatus,

    /// Time taken in milliseconds (for finished steps)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured data needed to rebuild run state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<EventDetail>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        step_index: Option<usize>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step_index,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
            detail: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_detail(mut self, detail: EventDetail) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Types of events that can occur during pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// A rerun of an existing run has started
    RunRestarted,

    /// Every step is terminal and none failed
    RunCompleted,

    /// A run failed
    RunFailed,

    /// A run was cancelled by the operator
    RunCancelled,

    /// A step has started execution
    StepStarted,

    /// A step attempt failed and is retried at the fallback tier
    StepRetrying,

    /// A step reached a verdict
    StepFinished,

    /// A safety limit was reached, halting execution
    SafetyLimitReached,
}

/// Per-step state machine: `pending -> running -> {succeeded | failed | ambiguous}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,

    /// Terminal, but flagged for operator review
    Ambiguous,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Ambiguous)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Ambiguous => "ambiguous",
        }
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Structured payloads carried by specific event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetail {
    /// Carried by `RunStarted`
    Run {
        pipeline: Pipeline,
        original_inputs: Vec<PathBuf>,
    },

    /// Carried by `RunRestarted`
    Restart { from_step: usize },

    /// Carried by `StepStarted`
    StepInputs {
        tool: String,
        image: String,
        inputs: Vec<PathBuf>,
        output_dir: PathBuf,
    },

    /// Carried by `StepRetrying`
    Fallback {
        tier: ResourceTier,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        issue: Option<IssueKind>,
    },

    /// Carried by `StepFinished`
    StepOutcome {
        reason: String,
        exit_code: Option<i32>,
        timed_out: bool,
        attempts: u32,
        outputs: Vec<PathBuf>,
        log_path: Option<PathBuf>,
        /// Category of the problem, absent for a clean success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        issue: Option<IssueKind>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            Some(1),
            EventType::StepStarted,
            "test-key".to_string(),
            "Starting fastqc".to_string(),
            StepStatus::Running,
        )
        .with_detail(EventDetail::StepInputs {
            tool: "fastqc".to_string(),
            image: "bioframe-fastqc:latest".to_string(),
            inputs: vec![PathBuf::from("/data/a.fastq")],
            output_dir: PathBuf::from("/data/step_1_fastqc"),
        });

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.status, StepStatus::Running);
        match parsed.detail {
            Some(EventDetail::StepInputs { inputs, .. }) => {
                assert_eq!(inputs, vec![PathBuf::from("/data/a.fastq")]);
            }
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[test]
    fn test_event_without_detail_omits_field() {
        let event = Event::new(
            Uuid::new_v4(),
            None,
            EventType::RunCompleted,
            "k".to_string(),
            "done".to_string(),
            StepStatus::Succeeded,
        )
        .with_duration(1500);

        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("detail"));
        assert_eq!(event.duration_ms, Some(1500));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Ambiguous.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
    }
}
