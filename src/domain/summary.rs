//! Execution summaries and categorized issues.
//!
//! Both are derived from a run's event log, so they can be produced for any
//! run on disk, finished or not. Issues are the history of everything that
//! went wrong, including attempts a later rerun replaced.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventDetail, EventType, StepStatus};
use super::run::{PipelineRun, RunState};

/// What kind of problem an issue records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// The tool ran and reported failure
    ToolFailure,
    Timeout,

    /// The container ran out of memory or CPU
    Resources,

    /// The container runtime could not start the tool
    Runtime,

    /// No usable inputs for a step
    Input,

    /// Run directory, log or output handling failed
    Filesystem,
    Safety,
    Cancelled,

    /// Clean exit without evidence of success
    Ambiguous,
}

impl IssueKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ToolFailure => "TOOL_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::Resources => "RESOURCE_ISSUE",
            Self::Runtime => "RUNTIME_ISSUE",
            Self::Input => "INPUT_ISSUE",
            Self::Filesystem => "FILESYSTEM_ISSUE",
            Self::Safety => "SAFETY_LIMIT",
            Self::Cancelled => "CANCELLED",
            Self::Ambiguous => "NEEDS_REVIEW",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,

    /// The run was halted
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// One categorized problem taken from the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub timestamp: DateTime<Utc>,
    pub step: Option<usize>,
    pub tool: Option<String>,
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    fn from_event(
        run: &PipelineRun,
        event: &Event,
        kind: IssueKind,
        severity: Severity,
        message: String,
    ) -> Self {
        Self {
            timestamp: event.timestamp,
            step: event.step_index,
            tool: event
                .step_index
                .and_then(|k| run.step(k))
                .map(|s| s.tool.clone()),
            kind,
            severity,
            message,
        }
    }
}

/// Per-step line of an execution summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub index: usize,
    pub tool: String,
    pub status: StepStatus,
    pub duration_ms: Option<u64>,
    pub attempts: u32,

    /// Fallback retries of the latest execution of this step
    pub fallbacks: u32,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

/// Execution summary of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
    pub steps: Vec<StepSummary>,
    pub succeeded: usize,
    pub failed: usize,
    pub ambiguous: usize,

    /// Percentage of steps that succeeded
    pub success_rate: f64,
    pub fallbacks: u32,
    pub issues: Vec<Issue>,
}

impl RunSummary {
    /// Summarize a run from its event log; `None` without a `RunStarted` head
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let run = PipelineRun::from_events(events)?;

        let mut fallbacks: BTreeMap<usize, u32> = BTreeMap::new();
        let mut issues: Vec<Issue> = Vec::new();

        for event in events {
            match event.event_type {
                EventType::StepStarted => {
                    if let Some(index) = event.step_index {
                        fallbacks.remove(&index);
                    }
                }
                EventType::RunRestarted => {
                    if let Some(EventDetail::Restart { from_step }) = &event.detail {
                        fallbacks.retain(|index, _| index < from_step);
                    }
                }
                EventType::StepRetrying => {
                    if let Some(index) = event.step_index {
                        *fallbacks.entry(index).or_default() += 1;
                    }
                    let (kind, reason) = match &event.detail {
                        Some(EventDetail::Fallback { issue, reason, .. }) => {
                            (issue.unwrap_or(IssueKind::Resources), reason.clone())
                        }
                        _ => (IssueKind::Resources, event.error.clone().unwrap_or_default()),
                    };
                    issues.push(Issue::from_event(
                        &run,
                        event,
                        kind,
                        Severity::Warning,
                        format!("retried at the fallback tier: {}", reason),
                    ));
                }
                EventType::StepFinished => {
                    let (kind, reason) = match &event.detail {
                        Some(EventDetail::StepOutcome { issue, reason, .. }) => {
                            (*issue, reason.clone())
                        }
                        _ => (None, event.error.clone().unwrap_or_default()),
                    };
                    match event.status {
                        StepStatus::Failed => {
                            let kind = kind.unwrap_or(IssueKind::ToolFailure);
                            let severity = if kind == IssueKind::Cancelled {
                                Severity::Warning
                            } else {
                                Severity::Error
                            };
                            issues.push(Issue::from_event(&run, event, kind, severity, reason));
                        }
                        StepStatus::Ambiguous => issues.push(Issue::from_event(
                            &run,
                            event,
                            IssueKind::Ambiguous,
                            Severity::Warning,
                            reason,
                        )),
                        _ => {}
                    }
                }
                EventType::SafetyLimitReached => issues.push(Issue::from_event(
                    &run,
                    event,
                    IssueKind::Safety,
                    Severity::Critical,
                    event.error.clone().unwrap_or_default(),
                )),
                EventType::RunCancelled => {
                    // A step interrupted mid-run already carries the cancellation
                    let recorded = issues
                        .last()
                        .is_some_and(|i| i.kind == IssueKind::Cancelled);
                    if !recorded {
                        issues.push(Issue::from_event(
                            &run,
                            event,
                            IssueKind::Cancelled,
                            Severity::Warning,
                            "run cancelled by operator".to_string(),
                        ));
                    }
                }
                EventType::RunStarted | EventType::RunCompleted | EventType::RunFailed => {}
            }
        }

        let steps: Vec<StepSummary> = run
            .steps
            .iter()
            .map(|step| StepSummary {
                index: step.index,
                tool: step.tool.clone(),
                status: step.status,
                duration_ms: step.result.as_ref().map(|r| r.duration_ms),
                attempts: step.result.as_ref().map_or(0, |r| r.attempts),
                fallbacks: fallbacks.get(&step.index).copied().unwrap_or(0),
                exit_code: step.result.as_ref().and_then(|r| r.exit_code),
                reason: step.result.as_ref().map(|r| r.reason.clone()),
            })
            .collect();

        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
        let succeeded = count(StepStatus::Succeeded);
        let failed = count(StepStatus::Failed);
        let ambiguous = count(StepStatus::Ambiguous);
        let success_rate = if steps.is_empty() {
            0.0
        } else {
            succeeded as f64 * 100.0 / steps.len() as f64
        };

        let total_duration_ms = run
            .completed_at
            .map(|end| (end - run.started_at).num_milliseconds().max(0) as u64);

        Some(Self {
            run_id: run.id,
            pipeline: run.pipeline.name.clone(),
            state: run.state.clone(),
            started_at: run.started_at,
            completed_at: run.completed_at,
            total_duration_ms,
            fallbacks: steps.iter().map(|s| s.fallbacks).sum(),
            steps,
            succeeded,
            failed,
            ambiguous,
            success_rate,
            issues,
        })
    }

    /// Number of issues per severity, most severe first
    pub fn severity_counts(&self) -> Vec<(Severity, usize)> {
        let mut counts: BTreeMap<Severity, usize> = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.severity).or_default() += 1;
        }
        counts.into_iter().rev().collect()
    }

    /// Human-readable execution report
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Run {} ({})\n", self.run_id, self.pipeline));
        out.push_str(&format!("State:     {}\n", self.state.label()));
        out.push_str(&format!("Started:   {}\n", self.started_at.to_rfc3339()));
        if let Some(completed) = self.completed_at {
            out.push_str(&format!("Completed: {}\n", completed.to_rfc3339()));
        }
        if let Some(ms) = self.total_duration_ms {
            out.push_str(&format!("Duration:  {}\n", format_ms(ms)));
        }
        out.push_str(&format!(
            "Steps:     {}/{} succeeded, {} failed, {} ambiguous ({:.1}%)\n",
            self.succeeded,
            self.steps.len(),
            self.failed,
            self.ambiguous,
            self.success_rate
        ));
        out.push_str(&format!("Fallbacks: {}\n\n", self.fallbacks));

        out.push_str(&format!(
            "{:<4} {:<16} {:<10} {:>9} {:>8}  {}\n",
            "#", "TOOL", "STATUS", "TIME", "ATTEMPTS", "DETAIL"
        ));
        for step in &self.steps {
            out.push_str(&format!(
                "{:<4} {:<16} {:<10} {:>9} {:>8}  {}\n",
                step.index,
                step.tool,
                step.status.label(),
                step.duration_ms.map(format_ms).unwrap_or_else(|| "-".to_string()),
                step.attempts,
                step.reason.as_deref().unwrap_or("")
            ));
        }

        if !self.issues.is_empty() {
            out.push_str(&format!("\nIssues ({}):\n", self.issues.len()));
            for issue in &self.issues {
                out.push_str(&format!("  {}\n", issue_line(issue)));
            }
        }

        out
    }

    /// Contents of the run's `logs/issues.log`
    pub fn render_issues(&self) -> String {
        let mut out = String::new();
        out.push_str("bioframe issues log\n");
        out.push_str(&format!("run:      {}\n", self.run_id));
        out.push_str(&format!("pipeline: {}\n", self.pipeline));
        out.push_str(&format!("state:    {}\n", self.state.label()));
        if let Some(completed) = self.completed_at {
            out.push_str(&format!("finished: {}\n", completed.to_rfc3339()));
        }
        out.push('\n');

        if self.issues.is_empty() {
            out.push_str("No issues recorded.\n");
            return out;
        }

        let breakdown: Vec<String> = self
            .severity_counts()
            .iter()
            .map(|(severity, n)| format!("{} {}", n, severity.label()))
            .collect();
        out.push_str(&format!(
            "{} issue(s): {}\n\n",
            self.issues.len(),
            breakdown.join(", ")
        ));

        for (i, issue) in self.issues.iter().enumerate() {
            out.push_str(&format!(
                "#{} {} {}\n",
                i + 1,
                issue.timestamp.to_rfc3339(),
                issue_line(issue)
            ));
        }

        out
    }
}

fn issue_line(issue: &Issue) -> String {
    let location = match (issue.step, &issue.tool) {
        (Some(step), Some(tool)) => format!(" step {} ({})", step, tool),
        (Some(step), None) => format!(" step {}", step),
        _ => String::new(),
    };
    format!(
        "[{}] {}{}: {}",
        issue.severity.label(),
        issue.kind,
        location,
        issue.message
    )
}

fn format_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}
