//! Outcome classification.
//!
//! Decision order, first match wins:
//! 1. a declared failure indicator in the output: failed
//! 2. a non-zero (or missing) exit code: failed
//! 3. every expected output exists and is non-empty: succeeded
//! 4. a declared success indicator in the output: succeeded
//! 5. otherwise: ambiguous
//!
//! Indicator matching is a case-sensitive substring search.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::runner::RawResult;
use super::synthesizer::SynthesisContext;
use crate::domain::{CommandTemplate, StepStatus, ToolMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Failed,

    /// Clean exit with no evidence either way; needs a human
    Ambiguous,
}

impl From<Verdict> for StepStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Succeeded => StepStatus::Succeeded,
            Verdict::Failed => StepStatus::Failed,
            Verdict::Ambiguous => StepStatus::Ambiguous,
        }
    }
}

/// A verdict plus the reasoning behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    pub reason: String,
}

impl Classification {
    fn new(verdict: Verdict, reason: impl Into<String>) -> Self {
        Self {
            verdict,
            reason: reason.into(),
        }
    }
}

/// Classify the final attempt of a step.
///
/// `ctx` supplies placeholder values for expected-output patterns; relative
/// patterns are resolved against `ctx.output_dir`.
pub fn classify(raw: &RawResult, metadata: &ToolMetadata, ctx: &SynthesisContext) -> Classification {
    if let Some(indicator) = first_found(&metadata.failure_indicators, &raw.output) {
        return Classification::new(
            Verdict::Failed,
            format!("output contains failure indicator '{}'", indicator),
        );
    }

    // Timeouts, cancellation and exhaustion count as a non-zero exit
    if let Some(error) = &raw.error {
        return Classification::new(Verdict::Failed, error.to_string());
    }

    match raw.exit_code {
        Some(0) => {}
        Some(code) => {
            return Classification::new(Verdict::Failed, format!("exit code {}", code));
        }
        None => {
            return Classification::new(Verdict::Failed, "process exited without a status code");
        }
    }

    if !metadata.expected_outputs.is_empty() {
        let missing = missing_outputs(&metadata.expected_outputs, ctx);
        if missing.is_empty() {
            return Classification::new(Verdict::Succeeded, "all expected outputs present");
        }
        if let Some(indicator) = first_found(&metadata.success_indicators, &raw.output) {
            return Classification::new(
                Verdict::Succeeded,
                format!(
                    "output contains success indicator '{}' (missing outputs: {})",
                    indicator,
                    missing.join(", ")
                ),
            );
        }
        return Classification::new(
            Verdict::Ambiguous,
            format!("exit code 0 but expected outputs missing: {}", missing.join(", ")),
        );
    }

    if let Some(indicator) = first_found(&metadata.success_indicators, &raw.output) {
        return Classification::new(
            Verdict::Succeeded,
            format!("output contains success indicator '{}'", indicator),
        );
    }

    Classification::new(
        Verdict::Ambiguous,
        "exit code 0 with no expected outputs declared and no success indicator",
    )
}

fn first_found<'a>(indicators: &'a [String], output: &str) -> Option<&'a str> {
    indicators
        .iter()
        .map(String::as_str)
        .find(|indicator| !indicator.is_empty() && output.contains(indicator))
}

/// Expected-output patterns that match no non-empty file
fn missing_outputs(patterns: &[String], ctx: &SynthesisContext) -> Vec<String> {
    patterns
        .iter()
        .filter(|pattern| !pattern_satisfied(pattern, ctx))
        .cloned()
        .collect()
}

fn pattern_satisfied(pattern: &str, ctx: &SynthesisContext) -> bool {
    let rendered = CommandTemplate::parse(pattern).render(|p| ctx.value_of(p));
    let path = Path::new(&rendered);
    let full: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        ctx.output_dir.join(path)
    };

    let Ok(entries) = glob::glob(&full.to_string_lossy()) else {
        // Not a valid glob; fall back to a literal path check
        return non_empty_file(&full);
    };

    entries.filter_map(Result::ok).any(|p| non_empty_file(&p))
}

fn non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
