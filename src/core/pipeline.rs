//! Pipeline definitions and loading.
//!
//! A pipeline is a linear chain of tool invocations. It is either loaded from
//! YAML or built from a plain tool list given on the command line.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::safety::SafetyLimits;

/// A complete pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// What to do when a step fails
    #[serde(default)]
    pub policy: RunPolicy,

    /// Safety limits for this pipeline
    #[serde(default)]
    pub safety_limits: SafetyLimits,

    /// Ordered list of steps; order is execution order
    pub steps: Vec<StepSpec>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Build a pipeline from tool names with default settings
    pub fn from_tools<S: AsRef<str>>(name: &str, tools: &[S]) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            policy: RunPolicy::default(),
            safety_limits: SafetyLimits::default(),
            steps: tools.iter().map(|t| StepSpec::new(t.as_ref())).collect(),
        }
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Pipeline must have at least one step");
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.tool.trim().is_empty() {
                anyhow::bail!("Step {} has an empty tool name", i + 1);
            }
        }

        self.safety_limits
            .validate_step_count(self.steps.len())
            .context("Pipeline exceeds its safety limits")?;

        Ok(())
    }

    /// Tool names in execution order
    pub fn tool_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.tool.as_str()).collect()
    }

    /// Get a step spec by 1-based index
    pub fn step(&self, index: usize) -> Option<&StepSpec> {
        index.checked_sub(1).and_then(|i| self.steps.get(i))
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Registered tool name
    pub tool: String,

    /// Override the tool's declared CPU requirement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,

    /// Override the tool's declared memory requirement (GB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<u32>,

    /// Override timeout for this step (uses safety_limits.step_timeout_seconds if not set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl StepSpec {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            threads: None,
            memory_gb: None,
            timeout_seconds: None,
        }
    }

    /// Get the effective per-attempt timeout for this step
    pub fn timeout(&self, limits: &SafetyLimits) -> Duration {
        let seconds = self.timeout_seconds.unwrap_or(limits.step_timeout_seconds);
        Duration::from_secs(seconds)
    }
}

/// Run-level policy on step failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPolicy {
    /// Keep advancing after a failed step instead of halting
    #[serde(default)]
    pub continue_on_error: bool,
}
