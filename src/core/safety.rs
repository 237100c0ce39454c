//! Safety limits and enforcement for pipeline execution.
//!
//! Prevents runaway execution through configurable limits on:
//! - Number of steps
//! - Per-step and whole-run wall-clock time
//! - Captured output kept per step
//! - Denylist patterns (uploaded files that must never reach a container)

use std::path::Path;
use std::time::{Duration, Instant};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Safety limits for pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum number of steps per run (default: 50)
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Per-attempt timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Total run timeout in seconds (default: 86400 = 1 day)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Captured output kept per step; older output is dropped first (default: 1MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Glob patterns to reject (uploaded files matching these won't be processed)
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_steps() -> u32 {
    50
}
fn default_step_timeout() -> u64 {
    3600
} // 1 hour; assemblers are slow
fn default_run_timeout() -> u64 {
    86400
} // 1 day
fn default_max_output_bytes() -> usize {
    1024 * 1024
} // 1MB

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
    ]
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_timeout_seconds: default_step_timeout(),
            run_timeout_seconds: default_run_timeout(),
            max_output_bytes: default_max_output_bytes(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl SafetyLimits {
    /// Check if a path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        let file_name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| {
                pattern.matches(path)
                    || file_name.as_deref().is_some_and(|name| pattern.matches(name))
            })
    }

    /// Reject pipelines longer than `max_steps`
    pub fn validate_step_count(&self, steps: usize) -> Result<(), SafetyViolation> {
        if steps as u64 > self.max_steps as u64 {
            return Err(SafetyViolation::MaxSteps {
                actual: steps as u32,
                limit: self.max_steps,
            });
        }
        Ok(())
    }

    /// Validate uploaded files against the denylist
    pub fn validate_inputs<P: AsRef<Path>>(&self, inputs: &[P]) -> Result<(), SafetyViolation> {
        for input in inputs {
            let path_str = input.as_ref().to_string_lossy();
            if self.is_denylisted(&path_str) {
                return Err(SafetyViolation::DenylistMatch {
                    path: path_str.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Check current tracker state against limits
    pub fn check(&self, tracker: &SafetyTracker) -> Result<(), SafetyViolation> {
        if tracker.steps_executed >= self.max_steps {
            return Err(SafetyViolation::MaxSteps {
                actual: tracker.steps_executed,
                limit: self.max_steps,
            });
        }

        let elapsed = tracker.started_at.elapsed().as_secs();
        if elapsed >= self.run_timeout_seconds {
            return Err(SafetyViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }

        Ok(())
    }

    /// Default per-attempt timeout
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }
}

/// Tracks resource usage during a run
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    /// Number of steps executed
    pub steps_executed: u32,

    /// When the run started
    pub started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    pub fn new() -> Self {
        Self {
            steps_executed: 0,
            started_at: Instant::now(),
        }
    }

    /// Record a step execution
    pub fn record_step(&mut self) {
        self.steps_executed += 1;
    }
}

/// Safety violation errors
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("Maximum steps exceeded: {actual} >= {limit}")]
    MaxSteps { actual: u32, limit: u32 },

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },
}
