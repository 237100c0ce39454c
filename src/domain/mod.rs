//! Domain types for the bioframe orchestrator.
//!
//! This module contains the core data structures:
//! - Tool: declared tool metadata and its extraction
//! - Template: tokenized command templates
//! - Events: immutable records of state changes
//! - Run: pipeline run and step state
//! - Summary: execution summaries and categorized issues

pub mod events;
pub mod run;
pub mod summary;
pub mod template;
pub mod tool;

// Re-export commonly used types
pub use events::{Event, EventDetail, EventType, StepStatus};
pub use run::{step_dir_name, step_output_dir, PipelineRun, PipelineStep, RunState, StepResult};
pub use summary::{Issue, IssueKind, RunSummary, Severity, StepSummary};
pub use template::{CommandTemplate, Placeholder, Segment};
pub use tool::{MetadataError, Presentation, ToolMetadata, METADATA_MARKER};
