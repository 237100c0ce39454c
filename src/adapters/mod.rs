//! Adapter interfaces for the container runtime.
//!
//! The orchestration core needs exactly three things from the container
//! layer: list images and read their build definitions, run a command in a
//! fresh container, and terminate a running container.

pub mod docker;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

// Re-export the Docker CLI adapter
pub use docker::DockerCli;

/// A host path made visible inside the container at the same path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub path: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn read_write(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
        }
    }

    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: true,
        }
    }
}

/// Everything needed to run one command in one fresh container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name, used for termination
    pub instance: String,

    /// Image reference, e.g. `bioframe-spades:latest`
    pub image: String,

    /// Shell command line, run through `sh -c`
    pub command: String,

    /// Working directory inside the container
    pub workdir: PathBuf,

    pub mounts: Vec<Mount>,
    pub memory_gb: u32,
    pub cpus: u32,
}

/// Output from a finished container
#[derive(Debug, Clone)]
pub struct ContainerOutput {
    /// Process exit code (`None` if terminated by a signal without a code)
    pub exit_code: Option<i32>,

    /// stdout followed by stderr
    pub output: String,
}

/// Trait for container execution backends
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable runtime name
    fn name(&self) -> &str;

    /// List all local image references as `repository:tag`
    async fn list_images(&self) -> Result<Vec<String>>;

    /// Fetch the build definition text of an image
    async fn build_definition(&self, image: &str) -> Result<String>;

    /// Run a command to completion inside a fresh container.
    ///
    /// Returns `Err` only when the container could not be started at all.
    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerOutput>;

    /// Stop a running container, waiting up to `grace` before killing it
    async fn terminate(&self, instance: &str, grace: Duration) -> Result<()>;
}
