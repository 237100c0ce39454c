//! Append-only event store with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. Each run directory also holds the step
//! output directories, captured logs and an advisory lock file.

use std::fs::OpenOptions as StdOpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{step_dir_name, Event};

/// File-based event store using JSONL format
pub struct EventStore {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Path to captured step output
    logs_dir: PathBuf,
}

impl EventStore {
    /// Create or open an event store for a run under `base_dir`
    pub async fn open_in(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());
        let logs_dir = run_dir.join("logs");

        fs::create_dir_all(&logs_dir)
            .await
            .with_context(|| format!("Failed to create logs directory: {}", logs_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
            logs_dir,
        })
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Where uploaded files are copied for this run
    pub fn input_dir(&self) -> PathBuf {
        self.run_dir.join("input")
    }

    /// Store the captured output of a step
    pub async fn write_log(&self, index: usize, tool: &str, content: &str) -> Result<PathBuf> {
        let log_path = self
            .logs_dir
            .join(format!("{}.log", step_dir_name(index, tool)));

        fs::write(&log_path, content)
            .await
            .with_context(|| format!("Failed to write step log: {}", log_path.display()))?;

        Ok(log_path)
    }

    /// Write the categorized issues of a finished run to `logs/issues.log`
    pub async fn write_issues_log(&self, content: &str) -> Result<PathBuf> {
        let path = self.logs_dir.join("issues.log");

        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write issues log: {}", path.display()))?;

        Ok(path)
    }

    /// Take the exclusive execution lock for this run.
    ///
    /// Fails immediately if another process or task is executing the run.
    pub fn lock(&self) -> Result<RunLock> {
        let path = self.run_dir.join("run.lock");
        let file = StdOpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        file.try_lock_exclusive()
            .with_context(|| format!("Run is already executing (lock held on {})", path.display()))?;

        Ok(RunLock { file })
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// List all run IDs in `base_dir`
    pub async fn list_runs_in(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

/// Held while a run executes; released on drop
#[derive(Debug)]
pub struct RunLock {
    file: std::fs::File,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Generate an idempotency key for a step over its resolved inputs
pub fn generate_idempotency_key(
    run_id: Uuid,
    step_index: usize,
    tool: &str,
    inputs: &[PathBuf],
) -> String {
    let mut material = tool.to_string();
    for input in inputs {
        material.push('\n');
        material.push_str(&input.to_string_lossy());
    }
    format!("{}:{}:{}", run_id, step_index, hash_input(&material))
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8]) // First 16 hex chars (8 bytes)
}
