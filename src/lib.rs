//! bioframe - Containerized bioinformatics pipeline orchestrator
//!
//! Chains command-line tools, each packaged as its own container image, into
//! linear pipelines over a set of uploaded files.
//!
//! # Architecture
//!
//! - Tools are discovered at runtime from local images named
//!   `bioframe-<tool>:<tag>`; each image's build definition carries a
//!   metadata block declaring how to invoke it
//! - Each step's inputs are the previous step's outputs plus any uploaded
//!   reference files
//! - Commands are expanded from the tool's template and run in a fresh
//!   container, with one reduced-resource retry on exhaustion
//! - Outcomes are classified as succeeded, failed, or ambiguous
//! - All state changes are recorded as immutable events; a run can be
//!   resumed or rerun from any step by replaying them
//!
//! # Modules
//!
//! - `adapters`: Container runtime boundary (Docker CLI)
//! - `core`: Registry, resolver, synthesizer, runner, classifier, orchestrator
//! - `domain`: Data structures (ToolMetadata, CommandTemplate, Event, PipelineRun)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # List discovered tools
//! bioframe tools --rescan
//!
//! # Run a two-step pipeline
//! bioframe run --tools fastqc,spades --input reads_R1.fq reads_R2.fq
//!
//! # Check run status
//! bioframe status <run-id>
//!
//! # Rerun from step 2
//! bioframe rerun <run-id> --from 2
//!
//! # Summary and categorized issues
//! bioframe report <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{CancelHandle, Orchestrator, Pipeline, ToolRegistry};
pub use domain::{Event, EventType, PipelineRun, RunState, ToolMetadata};
