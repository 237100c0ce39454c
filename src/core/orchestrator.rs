//! Main orchestrator for pipeline execution.
//!
//! Drives each step through resolve, synthesize, run and classify, and
//! records every transition in the run's event log before the next step can
//! see its outputs. Also implements rerun/resume over a replayed run, run
//! summaries and run deletion.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::adapters::{ContainerRuntime, DockerCli};
use crate::config::ResolvedConfig;
use crate::domain::{
    step_output_dir, Event, EventDetail, EventType, IssueKind, PipelineRun, RunState, RunSummary,
    StepStatus,
};

use super::classifier::{classify, Verdict};
use super::event_store::{generate_idempotency_key, EventStore, RunLock};
use super::pipeline::Pipeline;
use super::registry::{Tool, ToolMap, ToolRegistry};
use super::resolver::{InputResolver, ReferenceRules};
use super::runner::{
    CancelHandle, ExecutionRequest, ExecutionRunner, RawResult, ResourceTier, RunnerSettings,
};
use super::safety::{SafetyTracker, SafetyViolation};
use super::synthesizer::{synthesize, SynthesisContext};

/// What the sequencer needs to know after a step
struct StepReport {
    status: StepStatus,
    outputs: Vec<PathBuf>,
    cancelled: bool,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    runner: ExecutionRunner,
    resolver: InputResolver,

    /// Directory holding one subdirectory per run
    runs_dir: PathBuf,

    /// Copy uploaded files into `<run>/input/` before the run starts
    stage_inputs: bool,
}

impl Orchestrator {
    /// Create an orchestrator with default runner settings and reference rules
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ToolRegistry>,
        runs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            runner: ExecutionRunner::new(runtime, RunnerSettings::default()),
            resolver: InputResolver::default(),
            runs_dir: runs_dir.into(),
            stage_inputs: false,
        }
    }

    /// Create an orchestrator backed by the Docker CLI
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::from_config(config));
        let registry = Arc::new(ToolRegistry::new(
            Arc::clone(&runtime),
            config.image_prefix.clone(),
        ));

        Self::new(runtime, registry, config.runs_dir())
            .with_runner_settings(config.runtime.runner.clone())
            .with_reference_rules(config.reference.clone())
    }

    pub fn with_runner_settings(mut self, settings: RunnerSettings) -> Self {
        let runtime = self.runner.runtime();
        self.runner = ExecutionRunner::new(runtime, settings);
        self
    }

    pub fn with_reference_rules(mut self, rules: ReferenceRules) -> Self {
        self.resolver = InputResolver::new(rules);
        self
    }

    pub fn with_input_staging(mut self, stage: bool) -> Self {
        self.stage_inputs = stage;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Execute a pipeline over a set of uploaded files
    #[instrument(skip(self, pipeline, original_inputs, cancel), fields(pipeline = %pipeline.name))]
    pub async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        original_inputs: Vec<PathBuf>,
        cancel: &CancelHandle,
    ) -> Result<PipelineRun> {
        pipeline.validate()?;
        pipeline.safety_limits.validate_inputs(&original_inputs)?;
        for input in &original_inputs {
            if !input.is_file() {
                anyhow::bail!("Input file not found: {}", input.display());
            }
        }

        let tools = self.tools_for(pipeline).await?;

        let run_id = Uuid::new_v4();
        info!(%run_id, steps = pipeline.steps.len(), "Starting pipeline execution");

        let store = EventStore::open_in(&self.runs_dir, run_id).await?;
        let _lock = store.lock()?;

        let original_inputs = if self.stage_inputs {
            stage_inputs(&store.input_dir(), &original_inputs)?
        } else {
            original_inputs
        };

        let mut run = PipelineRun::new(run_id, pipeline.clone(), original_inputs.clone());
        let start_event = Event::new(
            run_id,
            None,
            EventType::RunStarted,
            format!("{}:start", run_id),
            format!("Pipeline '{}' started", pipeline.name),
            StepStatus::Running,
        )
        .with_detail(EventDetail::Run {
            pipeline: pipeline.clone(),
            original_inputs,
        });
        self.record(&store, &mut run, start_event).await?;

        self.execute_from(&store, &mut run, &tools, 1, None, cancel)
            .await
    }

    /// Re-execute a run starting at `from_step` (1-based).
    ///
    /// Earlier steps are reused only if their recorded outputs are all still on
    /// disk; otherwise execution starts at the earliest step that is not.
    #[instrument(skip(self, cancel), fields(run_id = %run_id))]
    pub async fn rerun_from(
        &self,
        run_id: Uuid,
        from_step: usize,
        cancel: &CancelHandle,
    ) -> Result<PipelineRun> {
        let (store, _lock, run) = self.lock_run(run_id).await?;
        self.rerun_locked(&store, run, from_step, cancel).await
    }

    /// Continue a run from its first step that did not succeed
    #[instrument(skip(self, cancel), fields(run_id = %run_id))]
    pub async fn resume_run(&self, run_id: Uuid, cancel: &CancelHandle) -> Result<PipelineRun> {
        let (store, _lock, run) = self.lock_run(run_id).await?;

        match run.first_incomplete_step() {
            Some(step) => {
                info!(step, "Resuming from step");
                self.rerun_locked(&store, run, step, cancel).await
            }
            None => {
                info!("Every step already succeeded; nothing to resume");
                Ok(run)
            }
        }
    }

    /// Rerun body; the caller holds the run lock and replayed after taking it
    async fn rerun_locked(
        &self,
        store: &EventStore,
        mut run: PipelineRun,
        from_step: usize,
        cancel: &CancelHandle,
    ) -> Result<PipelineRun> {
        if from_step == 0 || from_step > run.steps.len() {
            anyhow::bail!(
                "Step {} is out of range for run {} ({} steps)",
                from_step,
                run.id,
                run.steps.len()
            );
        }

        let tools = self.tools_for(&run.pipeline).await?;

        let start = (1..from_step)
            .find(|&k| run.step(k).is_some_and(|s| !s.is_reusable()))
            .unwrap_or(from_step);
        if start < from_step {
            warn!(
                requested = from_step,
                start, "Earlier step outputs are missing; restarting from an earlier step"
            );
        }

        // Recorded inputs are reused only if every one of them still exists
        let reuse_inputs = run
            .step(start)
            .map(|s| s.inputs.clone())
            .filter(|inputs| !inputs.is_empty() && inputs.iter().all(|p| p.exists()));

        info!(start, "Rerunning pipeline");
        let restart_event = Event::new(
            run.id,
            Some(start),
            EventType::RunRestarted,
            format!("{}:restart:{}", run.id, start),
            format!("Rerun from step {}", start),
            StepStatus::Running,
        )
        .with_detail(EventDetail::Restart { from_step: start });
        self.record(store, &mut run, restart_event).await?;

        self.execute_from(store, &mut run, &tools, start, reuse_inputs, cancel)
            .await
    }

    /// Get status of a run by ID
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<PipelineRun> {
        let store = self.open_existing(run_id).await?;
        replay_run(&store).await
    }

    /// Execution summary and categorized issues of a run
    pub async fn summarize_run(&self, run_id: Uuid) -> Result<RunSummary> {
        let store = self.open_existing(run_id).await?;
        let events = store.replay().await?;

        RunSummary::from_events(&events)
            .with_context(|| format!("No run start recorded for run {}", run_id))
    }

    /// Delete a run directory with its logs and step outputs.
    ///
    /// Refused while the run is executing.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        let store = self.open_existing(run_id).await?;
        let lock = store
            .lock()
            .with_context(|| format!("Cannot delete run {} while it is executing", run_id))?;

        tokio::fs::remove_dir_all(store.run_dir())
            .await
            .with_context(|| format!("Failed to delete {}", store.run_dir().display()))?;
        drop(lock);

        info!("Run deleted");
        Ok(())
    }

    /// List recent runs, most recent first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let run_ids = EventStore::list_runs_in(&self.runs_dir).await?;
        let mut runs = Vec::new();

        for run_id in run_ids {
            match self.get_run_status(run_id).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }

    async fn open_existing(&self, run_id: Uuid) -> Result<EventStore> {
        if !self.runs_dir.join(run_id.to_string()).is_dir() {
            anyhow::bail!("Run {} not found", run_id);
        }

        EventStore::open_in(&self.runs_dir, run_id).await
    }

    /// Take a run's lock, then replay it, so no writer can append in between
    async fn lock_run(&self, run_id: Uuid) -> Result<(EventStore, RunLock, PipelineRun)> {
        let store = self.open_existing(run_id).await?;
        let lock = store.lock()?;
        let run = replay_run(&store).await?;

        Ok((store, lock, run))
    }

    /// Resolve every pipeline tool against the registry before anything runs
    async fn tools_for(&self, pipeline: &Pipeline) -> Result<Arc<ToolMap>> {
        let tools = self.registry.discover().await?;

        let unknown: Vec<&str> = pipeline
            .tool_names()
            .into_iter()
            .filter(|name| !tools.contains_key(*name))
            .collect();
        if !unknown.is_empty() {
            anyhow::bail!(
                "Unknown tool(s): {} (run `bioframe tools --rescan` to refresh)",
                unknown.join(", ")
            );
        }

        Ok(tools)
    }

    /// Run steps `start..` in order until the end, a halt, or cancellation
    async fn execute_from(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        tools: &ToolMap,
        start: usize,
        mut reuse_inputs: Option<Vec<PathBuf>>,
        cancel: &CancelHandle,
    ) -> Result<PipelineRun> {
        let limits = run.pipeline.safety_limits.clone();
        let policy = run.pipeline.policy;
        let mut tracker = SafetyTracker::new();

        let mut previous_outputs = start
            .checked_sub(1)
            .and_then(|k| run.step(k))
            .map(|s| s.outputs.clone())
            .unwrap_or_default();

        for index in start..=run.steps.len() {
            if cancel.is_cancelled() {
                return self.cancel_run(store, run).await;
            }

            if let Err(violation) = limits.check(&tracker) {
                return self.handle_safety_violation(store, run, violation).await;
            }

            let spec = run
                .pipeline
                .step(index)
                .cloned()
                .with_context(|| format!("Pipeline has no step {}", index))?;
            let tool = tools
                .get(&spec.tool)
                .with_context(|| format!("Tool '{}' is not registered", spec.tool))?;

            let report = match self
                .execute_step(
                    store,
                    run,
                    index,
                    tool,
                    &spec,
                    &previous_outputs,
                    reuse_inputs.take(),
                    &mut tracker,
                    cancel,
                )
                .await
            {
                Ok(report) => report,
                Err(e) => {
                    self.abort_run(store, run, index, &e).await;
                    return Err(e);
                }
            };

            if report.cancelled {
                return self.cancel_run(store, run).await;
            }

            if report.status == StepStatus::Failed && !policy.continue_on_error {
                let message = format!("Step {} ({}) failed", index, spec.tool);
                return self.handle_run_failure(store, run, message).await;
            }

            previous_outputs = report.outputs;
        }

        self.complete_run(store, run).await
    }

    /// Resolve, synthesize, run and classify one step
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(step = index, tool = %spec.tool))]
    async fn execute_step(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        index: usize,
        tool: &Tool,
        spec: &super::pipeline::StepSpec,
        previous_outputs: &[PathBuf],
        reuse_inputs: Option<Vec<PathBuf>>,
        tracker: &mut SafetyTracker,
        cancel: &CancelHandle,
    ) -> Result<StepReport> {
        let metadata = &tool.metadata;
        let output_dir = step_output_dir(store.run_dir(), index, &spec.tool);

        let resolved = match reuse_inputs {
            Some(inputs) => Ok(inputs),
            None => self
                .resolver
                .resolve(index, metadata, previous_outputs, &run.original_inputs),
        };

        let inputs = match &resolved {
            Ok(inputs) => inputs.clone(),
            Err(_) => Vec::new(),
        };
        let idem_key = generate_idempotency_key(run.id, index, &spec.tool, &inputs);

        let start_event = Event::new(
            run.id,
            Some(index),
            EventType::StepStarted,
            idem_key.clone(),
            format!("Step {} '{}' started with {} input(s)", index, spec.tool, inputs.len()),
            StepStatus::Running,
        )
        .with_detail(EventDetail::StepInputs {
            tool: spec.tool.clone(),
            image: tool.image.clone(),
            inputs: inputs.clone(),
            output_dir: output_dir.clone(),
        });
        self.record(store, run, start_event).await?;
        prepare_output_dir(&output_dir)?;

        if let Err(e) = resolved {
            error!(error = %e, "Input resolution failed; step not executed");
            let reason = e.to_string();
            let event = Event::new(
                run.id,
                Some(index),
                EventType::StepFinished,
                idem_key,
                format!("Step {} '{}' failed: {}", index, spec.tool, reason),
                StepStatus::Failed,
            )
            .with_error(reason.clone())
            .with_detail(EventDetail::StepOutcome {
                reason,
                exit_code: None,
                timed_out: false,
                attempts: 0,
                outputs: Vec::new(),
                log_path: None,
                issue: Some(IssueKind::Input),
            });
            self.record(store, run, event).await?;
            tracker.record_step();

            return Ok(StepReport {
                status: StepStatus::Failed,
                outputs: Vec::new(),
                cancelled: false,
            });
        }

        let primary = ResourceTier::primary(
            spec.memory_gb.unwrap_or(metadata.memory_gb),
            spec.threads.unwrap_or(metadata.cpus),
        );
        let request = ExecutionRequest {
            instance: instance_name(run.id, index),
            image: tool.image.clone(),
            output_dir: output_dir.clone(),
            input_dirs: parent_dirs(&inputs),
            primary,
            timeout: spec.timeout(&run.pipeline.safety_limits),
            max_output_bytes: run.pipeline.safety_limits.max_output_bytes,
        };

        let context_for = |tier: &ResourceTier| {
            SynthesisContext::new(inputs.clone(), output_dir.clone())
                .with_resources(tier.cpus, tier.memory_gb)
        };
        let raw = self
            .runner
            .run(
                &request,
                |tier| synthesize(&metadata.command_template, &context_for(tier)),
                cancel,
            )
            .await;

        if let Some(reason) = &raw.fallback_reason {
            let event = Event::new(
                run.id,
                Some(index),
                EventType::StepRetrying,
                format!("{}:fallback", idem_key),
                format!(
                    "Step {} '{}' retrying at {} GB / {} CPU: {}",
                    index, spec.tool, raw.tier.memory_gb, raw.tier.cpus, reason
                ),
                StepStatus::Running,
            )
            .with_error(reason.to_string())
            .with_detail(EventDetail::Fallback {
                tier: raw.tier,
                reason: reason.to_string(),
                issue: Some(reason.issue_kind()),
            });
            self.record(store, run, event).await?;
        }

        let log_path = store
            .write_log(index, &spec.tool, &render_log(&raw))
            .await?;

        let classification = classify(&raw, metadata, &context_for(&raw.tier));
        let status = StepStatus::from(classification.verdict);
        let outputs = collect_outputs(&output_dir)?;
        tracker.record_step();

        let duration_ms = raw.duration.as_millis() as u64;
        let mut event = Event::new(
            run.id,
            Some(index),
            EventType::StepFinished,
            idem_key,
            format!(
                "Step {} '{}' {:?} in {}ms: {}",
                index, spec.tool, classification.verdict, duration_ms, classification.reason
            ),
            status,
        )
        .with_duration(duration_ms)
        .with_detail(EventDetail::StepOutcome {
            reason: classification.reason.clone(),
            exit_code: raw.exit_code,
            timed_out: raw.timed_out(),
            attempts: raw.attempts,
            outputs: outputs.clone(),
            log_path: Some(log_path),
            issue: match classification.verdict {
                Verdict::Succeeded => None,
                Verdict::Ambiguous => Some(IssueKind::Ambiguous),
                Verdict::Failed => Some(
                    raw.error
                        .as_ref()
                        .map_or(IssueKind::ToolFailure, |e| e.issue_kind()),
                ),
            },
        });
        if classification.verdict == Verdict::Failed {
            event = event.with_error(classification.reason.clone());
        }
        self.record(store, run, event).await?;

        match classification.verdict {
            Verdict::Succeeded => {
                info!(duration_ms, outputs = outputs.len(), "Step succeeded")
            }
            Verdict::Ambiguous => {
                warn!(reason = %classification.reason, "Step outcome ambiguous; flagged for review")
            }
            Verdict::Failed => {
                error!(reason = %classification.reason, attempts = raw.attempts, "Step failed")
            }
        }

        Ok(StepReport {
            status,
            outputs,
            cancelled: raw.cancelled(),
        })
    }

    /// Append an event and fold it into the in-memory run
    async fn record(&self, store: &EventStore, run: &mut PipelineRun, event: Event) -> Result<()> {
        store.append(&event).await?;
        run.apply_event(&event);
        Ok(())
    }

    /// Handle a safety violation by logging and updating run state
    async fn handle_safety_violation(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        violation: SafetyViolation,
    ) -> Result<PipelineRun> {
        let error_msg = violation.to_string();
        error!(%error_msg, "Safety limit reached");

        let event = Event::new(
            run.id,
            None,
            EventType::SafetyLimitReached,
            format!("{}:safety", run.id),
            format!("Safety limit reached: {}", error_msg),
            StepStatus::Failed,
        )
        .with_error(error_msg);
        self.finish(store, run, event).await
    }

    /// Handle a run failure
    async fn handle_run_failure(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        error_msg: String,
    ) -> Result<PipelineRun> {
        error!(%error_msg, "Run failed");

        let event = Event::new(
            run.id,
            None,
            EventType::RunFailed,
            format!("{}:complete", run.id),
            format!("Run failed: {}", error_msg),
            StepStatus::Failed,
        )
        .with_error(error_msg);
        self.finish(store, run, event).await
    }

    async fn cancel_run(&self, store: &EventStore, run: &mut PipelineRun) -> Result<PipelineRun> {
        warn!(run_id = %run.id, "Run cancelled");

        let event = Event::new(
            run.id,
            None,
            EventType::RunCancelled,
            format!("{}:cancel", run.id),
            "Run cancelled by operator".to_string(),
            StepStatus::Failed,
        );
        self.finish(store, run, event).await
    }

    /// Finish a run whose steps all reached a verdict
    async fn complete_run(&self, store: &EventStore, run: &mut PipelineRun) -> Result<PipelineRun> {
        if let RunState::Failed { error } = run.derive_completion_state() {
            return self.handle_run_failure(store, run, error).await;
        }

        let flagged = run.flagged_for_review();
        if flagged.is_empty() {
            info!(run_id = %run.id, "Run completed successfully");
        } else {
            warn!(run_id = %run.id, steps = ?flagged, "Run completed; some steps need review");
        }

        let event = Event::new(
            run.id,
            None,
            EventType::RunCompleted,
            format!("{}:complete", run.id),
            format!("Pipeline '{}' completed", run.pipeline.name),
            StepStatus::Succeeded,
        );
        self.finish(store, run, event).await
    }

    /// Record a terminal run event and refresh the issues log
    async fn finish(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        event: Event,
    ) -> Result<PipelineRun> {
        self.record(store, run, event).await?;
        self.write_issues_log(store).await;
        Ok(run.clone())
    }

    /// Close out a run after an error the sequencer cannot recover from.
    ///
    /// The step that was running is marked failed and the run failed, so the
    /// log never ends with a step stuck in `running`. Recording is best effort;
    /// the caller returns the original error.
    async fn abort_run(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        index: usize,
        cause: &anyhow::Error,
    ) {
        let reason = format!("{:#}", cause);
        error!(step = index, error = %reason, "Step aborted");

        if run.step(index).is_some_and(|s| s.status == StepStatus::Running) {
            let event = Event::new(
                run.id,
                Some(index),
                EventType::StepFinished,
                format!("{}:{}:abort", run.id, index),
                format!("Step {} aborted: {}", index, reason),
                StepStatus::Failed,
            )
            .with_error(reason.clone())
            .with_detail(EventDetail::StepOutcome {
                reason: reason.clone(),
                exit_code: None,
                timed_out: false,
                attempts: 0,
                outputs: Vec::new(),
                log_path: None,
                issue: Some(IssueKind::Filesystem),
            });
            if let Err(e) = self.record(store, run, event).await {
                error!(error = %e, "Failed to record aborted step");
                return;
            }
        }

        let message = format!("Step {} aborted: {}", index, reason);
        let event = Event::new(
            run.id,
            None,
            EventType::RunFailed,
            format!("{}:complete", run.id),
            format!("Run failed: {}", message),
            StepStatus::Failed,
        )
        .with_error(message);
        if let Err(e) = self.finish(store, run, event).await {
            error!(error = %e, "Failed to record run failure");
        }
    }

    /// Rewrite `logs/issues.log` from the event log; failures are only logged
    async fn write_issues_log(&self, store: &EventStore) {
        let written: Result<PathBuf> = async {
            let events = store.replay().await?;
            let summary =
                RunSummary::from_events(&events).context("Event log has no run start")?;
            store.write_issues_log(&summary.render_issues()).await
        }
        .await;

        match written {
            Ok(path) => debug!(path = %path.display(), "Issues log written"),
            Err(e) => warn!(error = %e, "Failed to write issues log"),
        }
    }
}

/// Rebuild a run from its event log
async fn replay_run(store: &EventStore) -> Result<PipelineRun> {
    let events = store.replay().await?;
    if events.is_empty() {
        anyhow::bail!("No events found in {}", store.events_path().display());
    }

    PipelineRun::from_events(&events).context("Failed to reconstruct run state")
}

/// Container name for a step: unique per run and step
fn instance_name(run_id: Uuid, index: usize) -> String {
    let id = run_id.simple().to_string();
    format!("bioframe-{}-step{}", &id[..12], index)
}

/// Directories containing the inputs, in first-seen order
fn parent_dirs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in inputs.iter().filter_map(|p| p.parent()) {
        if !dir.as_os_str().is_empty() && !dirs.iter().any(|d| d == dir) {
            dirs.push(dir.to_path_buf());
        }
    }
    dirs
}

/// Copy uploads into the run, keeping upload order and file names
fn stage_inputs(input_dir: &Path, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(input_dir)
        .with_context(|| format!("Failed to create input directory: {}", input_dir.display()))?;

    let mut staged = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        let name = input
            .file_name()
            .with_context(|| format!("Input has no file name: {}", input.display()))?;

        let mut target = input_dir.join(name);
        if staged.contains(&target) {
            target = input_dir.join(format!("{}_{}", i + 1, name.to_string_lossy()));
        }

        std::fs::copy(input, &target).with_context(|| {
            format!("Failed to copy {} to {}", input.display(), target.display())
        })?;
        staged.push(target);
    }

    Ok(staged)
}

/// Create an empty output directory, moving any previous contents aside
fn prepare_output_dir(dir: &Path) -> Result<()> {
    let has_contents = std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);

    if has_contents {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stamp = chrono::Utc::now().timestamp();

        let mut target = dir.with_file_name(format!("{}.superseded-{}", name, stamp));
        let mut n = 1;
        while target.exists() {
            target = dir.with_file_name(format!("{}.superseded-{}-{}", name, stamp, n));
            n += 1;
        }

        std::fs::rename(dir, &target).with_context(|| {
            format!(
                "Failed to move previous output {} aside to {}",
                dir.display(),
                target.display()
            )
        })?;
        info!(from = %dir.display(), to = %target.display(), "Previous step output superseded");
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))
}

/// Files produced in a step's output directory, oldest first
fn collect_outputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to scan outputs in {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((modified, entry.into_path()));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

fn render_log(raw: &RawResult) -> String {
    let exit = raw
        .exit_code
        .map_or_else(|| "none".to_string(), |c| c.to_string());
    let mut log = format!(
        "# command: {}\n# exit code: {}\n# attempts: {} ({:?} tier, {} GB, {} CPU)\n",
        raw.command, exit, raw.attempts, raw.tier.level, raw.tier.memory_gb, raw.tier.cpus
    );
    if let Some(error) = &raw.error {
        log.push_str(&format!("# error: {}\n", error));
    }
    log.push('\n');
    log.push_str(&raw.output);
    log
}
