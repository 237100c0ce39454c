//! Core orchestration logic.
//!
//! This module contains:
//! - Registry: tool discovery over the container runtime
//! - Resolver: per-step input selection
//! - Synthesizer: command template expansion
//! - Runner: container execution with resource fallback
//! - Classifier: success/failure/ambiguous verdicts
//! - EventStore: Append-only event logging
//! - Pipeline: Pipeline definitions and loading
//! - Safety: Safety limits and enforcement
//! - Orchestrator: Main execution engine

pub mod classifier;
pub mod event_store;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod safety;
pub mod synthesizer;

// Re-export commonly used types
pub use classifier::{classify, Classification, Verdict};
pub use event_store::{generate_idempotency_key, hash_input, EventStore, RunLock};
pub use orchestrator::Orchestrator;
pub use pipeline::{Pipeline, RunPolicy, StepSpec};
pub use registry::{compare_tags, ImageRef, Tool, ToolMap, ToolRegistry};
pub use resolver::{InputResolver, ReferenceRules, ResolutionError};
pub use runner::{
    CancelHandle, ExecutionError, ExecutionRequest, ExecutionRunner, RawResult, ResourceTier,
    RunnerSettings, TierLevel,
};
pub use safety::{SafetyLimits, SafetyTracker, SafetyViolation};
pub use synthesizer::{synthesize, SynthesisContext};
