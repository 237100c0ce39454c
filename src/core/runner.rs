//! Execution runner: one step, at most two container attempts.
//!
//! The primary attempt runs at the tool's declared resources. If it fails in
//! a way attributable to resources (an exhaustion exit code or output
//! signature, a timeout, or a container that never started) exactly one
//! fallback attempt runs at a reduced tier. Its result is final.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::adapters::{ContainerRuntime, ContainerSpec, Mount};
use crate::domain::IssueKind;

/// Extra time allowed for a terminated container to hand back its output
const DRAIN_SLACK: Duration = Duration::from_secs(5);

/// Runner tuning, read from the `runtime` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Seconds a container gets to stop before it is killed
    pub grace_period_seconds: u64,

    /// CPU count of the fallback tier
    pub fallback_cpus: u32,

    /// Fallback memory = primary memory / divisor (minimum 1 GB)
    pub fallback_memory_divisor: u32,

    /// Exit codes that mean the container ran out of resources
    pub exhaustion_exit_codes: Vec<i32>,

    /// Output substrings that mean the container ran out of resources
    pub exhaustion_signatures: Vec<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            grace_period_seconds: 10,
            fallback_cpus: 1,
            fallback_memory_divisor: 2,
            exhaustion_exit_codes: vec![137],
            exhaustion_signatures: [
                "Killed",
                "Out of memory",
                "OutOfMemoryError",
                "MemoryError",
                "std::bad_alloc",
                "Cannot allocate memory",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl RunnerSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    /// The exhaustion signature found in a failed attempt, if any
    fn exhaustion_signature(&self, exit_code: Option<i32>, output: &str) -> Option<String> {
        if let Some(code) = exit_code {
            if self.exhaustion_exit_codes.contains(&code) {
                return Some(format!("exit code {}", code));
            }
            if code == 0 {
                return None;
            }
        }

        self.exhaustion_signatures
            .iter()
            .find(|sig| output.contains(sig.as_str()))
            .map(|sig| format!("output contains '{}'", sig))
    }
}

/// Which of the two tiers an attempt ran at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierLevel {
    Primary,
    Fallback,
}

/// Resource limits for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTier {
    pub level: TierLevel,
    pub memory_gb: u32,
    pub cpus: u32,
}

impl ResourceTier {
    pub fn primary(memory_gb: u32, cpus: u32) -> Self {
        Self {
            level: TierLevel::Primary,
            memory_gb: memory_gb.max(1),
            cpus: cpus.max(1),
        }
    }

    /// The reduced tier derived from a primary tier. Never larger than the primary.
    pub fn fallback(primary: &ResourceTier, settings: &RunnerSettings) -> Self {
        let divisor = settings.fallback_memory_divisor.max(1);
        Self {
            level: TierLevel::Fallback,
            memory_gb: (primary.memory_gb / divisor).max(1),
            cpus: settings.fallback_cpus.clamp(1, primary.cpus.max(1)),
        }
    }
}

/// Why an attempt failed before it could produce a normal result
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("container could not be started: {message}")]
    Spawn { message: String },

    #[error("attempt exceeded its {seconds}s timeout")]
    TimedOut { seconds: u64 },

    #[error("resource exhaustion ({signature})")]
    ResourceExhausted { signature: String },

    #[error("cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Whether this failure earns the one fallback attempt
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    pub fn issue_kind(&self) -> IssueKind {
        match self {
            Self::Spawn { .. } => IssueKind::Runtime,
            Self::TimedOut { .. } => IssueKind::Timeout,
            Self::ResourceExhausted { .. } => IssueKind::Resources,
            Self::Cancelled => IssueKind::Cancelled,
        }
    }
}

/// Everything the runner needs besides the command text
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Container name stem; attempts append `-1`, `-2`
    pub instance: String,

    pub image: String,

    /// Working directory inside the container, mounted read-write
    pub output_dir: PathBuf,

    /// Additional directories holding inputs, mounted read-only
    pub input_dirs: Vec<PathBuf>,

    pub primary: ResourceTier,

    /// Wall-clock bound on each attempt
    pub timeout: Duration,

    /// Captured output kept, counted from the end
    pub max_output_bytes: usize,
}

impl ExecutionRequest {
    fn mounts(&self) -> Vec<Mount> {
        let mut mounts = vec![Mount::read_write(&self.output_dir)];
        for dir in &self.input_dirs {
            if !dir.starts_with(&self.output_dir) && !mounts.iter().any(|m| &m.path == dir) {
                mounts.push(Mount::read_only(dir));
            }
        }
        mounts
    }
}

/// Outcome of the final attempt of a step
#[derive(Debug, Clone)]
pub struct RawResult {
    /// `None` if the container never started or was killed by a signal
    pub exit_code: Option<i32>,

    /// Combined stdout and stderr, tail-preserved
    pub output: String,

    /// Command text of the final attempt
    pub command: String,

    /// Wall-clock time across all attempts
    pub duration: Duration,

    /// The tier the final attempt ran at
    pub tier: ResourceTier,

    /// 1 or 2
    pub attempts: u32,

    /// Failure of the final attempt, if it did not finish normally
    pub error: Option<ExecutionError>,

    /// Why the fallback attempt ran, if it did
    pub fallback_reason: Option<ExecutionError>,
}

impl RawResult {
    pub fn timed_out(&self) -> bool {
        matches!(self.error, Some(ExecutionError::TimedOut { .. }))
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.error, Some(ExecutionError::Cancelled))
    }
}

/// Cooperative cancellation flag shared between a caller and a running pipeline
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Result of one attempt before fallback decisions
struct Attempt {
    exit_code: Option<i32>,
    output: String,
    error: Option<ExecutionError>,
}

/// Runs steps on a container runtime
pub struct ExecutionRunner {
    runtime: Arc<dyn ContainerRuntime>,
    settings: RunnerSettings,
}

impl ExecutionRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: RunnerSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::clone(&self.runtime)
    }

    /// Run a step. `command_for` renders the command for a given tier so
    /// `{threads}` and `{memory}` follow the fallback.
    #[instrument(skip(self, request, command_for, cancel), fields(image = %request.image))]
    pub async fn run<F>(
        &self,
        request: &ExecutionRequest,
        command_for: F,
        cancel: &CancelHandle,
    ) -> RawResult
    where
        F: Fn(&ResourceTier) -> String,
    {
        let started = Instant::now();
        let mut tier = request.primary;
        let mut fallback_reason = None;
        let mut attempt_no = 1;

        loop {
            let command = command_for(&tier);
            let spec = ContainerSpec {
                instance: format!("{}-{}", request.instance, attempt_no),
                image: request.image.clone(),
                command: command.clone(),
                workdir: request.output_dir.clone(),
                mounts: request.mounts(),
                memory_gb: tier.memory_gb,
                cpus: tier.cpus,
            };

            info!(
                attempt = attempt_no,
                tier = ?tier.level,
                memory_gb = tier.memory_gb,
                cpus = tier.cpus,
                "Starting container"
            );
            let attempt = self.attempt(&spec, request.timeout, cancel).await;

            let retry = match &attempt.error {
                Some(err) if attempt_no == 1 && err.allows_fallback() => Some(err.clone()),
                _ => None,
            };

            if let Some(reason) = retry {
                warn!(
                    attempt = attempt_no,
                    error = %reason,
                    "Primary attempt failed; retrying at fallback tier"
                );
                tier = ResourceTier::fallback(&request.primary, &self.settings);
                fallback_reason = Some(reason);
                attempt_no += 1;
                continue;
            }

            return RawResult {
                exit_code: attempt.exit_code,
                output: truncate_tail(attempt.output, request.max_output_bytes),
                command,
                duration: started.elapsed(),
                tier,
                attempts: attempt_no,
                error: attempt.error,
                fallback_reason,
            };
        }
    }

    async fn attempt(&self, spec: &ContainerSpec, timeout: Duration, cancel: &CancelHandle) -> Attempt {
        if cancel.is_cancelled() {
            return Attempt {
                exit_code: None,
                output: String::new(),
                error: Some(ExecutionError::Cancelled),
            };
        }

        let run = self.runtime.run(spec);
        tokio::pin!(run);

        let interrupted = tokio::select! {
            result = &mut run => return self.finished(result),
            _ = tokio::time::sleep(timeout) => ExecutionError::TimedOut { seconds: timeout.as_secs() },
            _ = cancel.cancelled() => ExecutionError::Cancelled,
        };

        warn!(instance = %spec.instance, reason = %interrupted, "Terminating container");
        let grace = self.settings.grace_period();
        let (stopped, drained) = tokio::join!(
            self.runtime.terminate(&spec.instance, grace),
            tokio::time::timeout(grace + DRAIN_SLACK, &mut run),
        );
        if let Err(e) = stopped {
            warn!(instance = %spec.instance, error = %e, "Failed to terminate container");
        }

        // Keep whatever the container printed before it was stopped
        let (exit_code, output) = match drained {
            Ok(Ok(out)) => (out.exit_code, out.output),
            Ok(Err(e)) => (None, format!("{:#}", e)),
            Err(_) => (None, String::new()),
        };

        Attempt {
            exit_code,
            output,
            error: Some(interrupted),
        }
    }

    fn finished(&self, result: anyhow::Result<crate::adapters::ContainerOutput>) -> Attempt {
        match result {
            Ok(out) => {
                let error = self
                    .settings
                    .exhaustion_signature(out.exit_code, &out.output)
                    .map(|signature| ExecutionError::ResourceExhausted { signature });
                Attempt {
                    exit_code: out.exit_code,
                    output: out.output,
                    error,
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                Attempt {
                    exit_code: None,
                    output: message.clone(),
                    error: Some(ExecutionError::Spawn { message }),
                }
            }
        }
    }
}

/// Keep the last `max_bytes` of `output`, marking what was dropped
pub fn truncate_tail(output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }

    let mut cut = output.len() - max_bytes;
    while !output.is_char_boundary(cut) {
        cut += 1;
    }

    format!("[... {} bytes truncated ...]\n{}", cut, &output[cut..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ContainerOutput;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    enum Script {
        Exit(i32, &'static str),
        NoStart,
        Hang,
    }

    struct ScriptedRuntime {
        script: Mutex<VecDeque<Script>>,
        specs: Mutex<Vec<ContainerSpec>>,
        stopped: Notify,
    }

    impl ScriptedRuntime {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                specs: Mutex::new(Vec::new()),
                stopped: Notify::new(),
            })
        }

        fn specs(&self) -> Vec<ContainerSpec> {
            self.specs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn list_images(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn build_definition(&self, _image: &str) -> Result<String> {
            anyhow::bail!("not used")
        }

        async fn run(&self, spec: &ContainerSpec) -> Result<ContainerOutput> {
            self.specs.lock().unwrap().push(spec.clone());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Script::Exit(code, output)) => Ok(ContainerOutput {
                    exit_code: Some(code),
                    output: output.to_string(),
                }),
                Some(Script::NoStart) => anyhow::bail!("no such image"),
                Some(Script::Hang) => {
                    self.stopped.notified().await;
                    Ok(ContainerOutput {
                        exit_code: Some(143),
                        output: "partial progress".to_string(),
                    })
                }
                None => anyhow::bail!("script exhausted"),
            }
        }

        async fn terminate(&self, _instance: &str, _grace: Duration) -> Result<()> {
            self.stopped.notify_one();
            Ok(())
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            instance: "bioframe-test-step1".to_string(),
            image: "bioframe-spades:latest".to_string(),
            output_dir: PathBuf::from("/runs/r/step_1_spades"),
            input_dirs: vec![PathBuf::from("/runs/r/input")],
            primary: ResourceTier::primary(16, 8),
            timeout: Duration::from_secs(30),
            max_output_bytes: 1024,
        }
    }

    fn settings() -> RunnerSettings {
        RunnerSettings {
            grace_period_seconds: 0,
            ..Default::default()
        }
    }

    fn command(tier: &ResourceTier) -> String {
        format!("spades.py -t {} -m {}", tier.cpus, tier.memory_gb)
    }

    #[tokio::test]
    async fn test_clean_exit_single_attempt() {
        let runtime = ScriptedRuntime::new(vec![Script::Exit(0, "done")]);
        let runner = ExecutionRunner::new(runtime.clone(), settings());

        let result = runner.run(&request(), command, &CancelHandle::new()).await;

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.attempts, 1);
        assert!(result.error.is_none());
        assert_eq!(result.command, "spades.py -t 8 -m 16");

        let specs = runtime.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].memory_gb, 16);
        assert_eq!(specs[0].workdir, PathBuf::from("/runs/r/step_1_spades"));
    }

    #[tokio::test]
    async fn test_plain_failure_does_not_fall_back() {
        let runtime = ScriptedRuntime::new(vec![Script::Exit(1, "bad arguments")]);
        let runner = ExecutionRunner::new(runtime.clone(), settings());

        let result = runner.run(&request(), command, &CancelHandle::new()).await;
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.attempts, 1);
        assert_eq!(runtime.specs().len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_gets_exactly_one_fallback() {
        let runtime = ScriptedRuntime::new(vec![
            Script::Exit(137, ""),
            Script::Exit(1, "std::bad_alloc"),
            Script::Exit(0, "never reached"),
        ]);
        let runner = ExecutionRunner::new(runtime.clone(), settings());

        let result = runner.run(&request(), command, &CancelHandle::new()).await;

        assert_eq!(result.attempts, 2);
        assert_eq!(result.exit_code, Some(1));
        assert!(matches!(result.error, Some(ExecutionError::ResourceExhausted { .. })));
        assert!(matches!(
            result.fallback_reason,
            Some(ExecutionError::ResourceExhausted { .. })
        ));
        assert_eq!(result.tier.level, TierLevel::Fallback);
        assert_eq!(result.command, "spades.py -t 1 -m 8");

        let specs = runtime.specs();
        assert_eq!(specs.len(), 2);
        assert_eq!((specs[1].memory_gb, specs[1].cpus), (8, 1));
        assert_ne!(specs[0].instance, specs[1].instance);
    }

    #[tokio::test]
    async fn test_spawn_failure_falls_back() {
        let runtime = ScriptedRuntime::new(vec![Script::NoStart, Script::Exit(0, "ok")]);
        let runner = ExecutionRunner::new(runtime, settings());

        let result = runner.run(&request(), command, &CancelHandle::new()).await;
        assert_eq!(result.attempts, 2);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.error.is_none());
        assert!(matches!(result.fallback_reason, Some(ExecutionError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let runtime = ScriptedRuntime::new(vec![Script::Hang, Script::Hang]);
        let runner = ExecutionRunner::new(runtime, settings());
        let mut req = request();
        req.timeout = Duration::from_millis(20);

        let result = runner.run(&req, command, &CancelHandle::new()).await;
        assert!(result.timed_out());
        assert_eq!(result.attempts, 2);
        assert_eq!(result.output, "partial progress");
    }

    #[tokio::test]
    async fn test_cancel_mid_attempt_skips_fallback() {
        let runtime = ScriptedRuntime::new(vec![Script::Hang]);
        let runner = ExecutionRunner::new(runtime.clone(), settings());
        let cancel = CancelHandle::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = runner.run(&request(), command, &cancel).await;
        assert!(result.cancelled());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.output, "partial progress");
        assert_eq!(runtime.specs().len(), 1);
    }

    #[test]
    fn test_fallback_tier_bounds() {
        let settings = RunnerSettings::default();

        let big = ResourceTier::fallback(&ResourceTier::primary(16, 8), &settings);
        assert_eq!((big.memory_gb, big.cpus), (8, 1));

        let small = ResourceTier::fallback(&ResourceTier::primary(1, 1), &settings);
        assert_eq!((small.memory_gb, small.cpus), (1, 1));
    }

    #[test]
    fn test_exhaustion_detection() {
        let settings = RunnerSettings::default();
        assert!(settings.exhaustion_signature(Some(137), "").is_some());
        assert!(settings.exhaustion_signature(Some(1), "java.lang.OutOfMemoryError").is_some());
        assert!(settings.exhaustion_signature(None, "Killed").is_some());
        // A clean exit that merely mentions memory is not exhaustion
        assert!(settings.exhaustion_signature(Some(0), "MemoryError handled").is_none());
        assert!(settings.exhaustion_signature(Some(2), "usage: tool").is_none());
    }

    #[test]
    fn test_truncate_tail() {
        assert_eq!(truncate_tail("short".to_string(), 10), "short");

        let out = truncate_tail("0123456789ERROR".to_string(), 5);
        assert_eq!(out, "[... 10 bytes truncated ...]\nERROR");

        // Never split a multi-byte character
        let out = truncate_tail("ααα".to_string(), 3);
        assert!(out.ends_with('α'));
        assert!(out.starts_with("[... 4 bytes truncated ...]"));
    }

    #[test]
    fn test_mounts_skip_duplicates() {
        let mut req = request();
        req.input_dirs = vec![
            PathBuf::from("/up"),
            PathBuf::from("/up"),
            PathBuf::from("/runs/r/step_1_spades"),
        ];
        let mounts = req.mounts();
        assert_eq!(
            mounts,
            vec![
                Mount::read_write("/runs/r/step_1_spades"),
                Mount::read_only("/up")
            ]
        );
    }
}
