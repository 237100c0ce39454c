//! Docker adapter using the `docker` CLI in subprocess mode.
//!
//! Host paths are mounted at identical paths inside the container, so a
//! command synthesized against host paths runs unchanged.
//!
//! Images do not carry their Dockerfile, so build definitions are read from
//! the tools directory: `<tools_dir>/<tool>/Dockerfile`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ContainerOutput, ContainerRuntime, ContainerSpec};

/// Exit status `docker run` uses when the daemon or CLI itself failed, so the
/// container never ran. 126 and 127 come from the shell inside the container
/// and stay tool exit codes.
const DOCKER_RUN_FAILED: i32 = 125;

/// Docker runtime using subprocess mode
pub struct DockerCli {
    /// Path to the container CLI (default: "docker")
    binary_path: String,

    /// Directory containing one subdirectory per tool with its Dockerfile
    tools_dir: PathBuf,

    /// Image prefix used to map an image back to its tool directory
    image_prefix: String,
}

impl DockerCli {
    pub fn new(
        binary_path: impl Into<String>,
        tools_dir: impl Into<PathBuf>,
        image_prefix: impl Into<String>,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            tools_dir: tools_dir.into(),
            image_prefix: image_prefix.into(),
        }
    }

    /// Create an adapter from the resolved configuration
    pub fn from_config(config: &crate::config::ResolvedConfig) -> Self {
        Self::new(
            config.runtime.binary.clone(),
            config.tools_dir.clone(),
            config.image_prefix.clone(),
        )
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools_dir
    }

    /// Arguments for `docker run`, excluding the binary itself
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.instance.clone(),
            "--memory".to_string(),
            format!("{}g", spec.memory_gb),
            "--cpus".to_string(),
            spec.cpus.to_string(),
        ];

        for mount in &spec.mounts {
            let path = mount.path.display();
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push("-v".to_string());
            args.push(format!("{}:{}:{}", path, path, mode));
        }

        args.extend([
            "-w".to_string(),
            spec.workdir.display().to_string(),
            "--entrypoint".to_string(),
            "/bin/sh".to_string(),
            spec.image.clone(),
            "-c".to_string(),
            spec.command.clone(),
        ]);

        args
    }

    async fn capture(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary_path)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run '{} {}'", self.binary_path, args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "'{} {}' failed with exit code {}: {}",
                self.binary_path,
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let stdout = self
            .capture(&["images", "--format", "{{.Repository}}:{{.Tag}}"])
            .await?;

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn build_definition(&self, image: &str) -> Result<String> {
        let repository = image.rsplit_once(':').map_or(image, |(repo, _)| repo);
        let tool = repository
            .strip_prefix(&self.image_prefix)
            .unwrap_or(repository);
        let dockerfile = self.tools_dir.join(tool).join("Dockerfile");

        tokio::fs::read_to_string(&dockerfile)
            .await
            .with_context(|| format!("Failed to read build definition: {}", dockerfile.display()))
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerOutput> {
        let args = Self::run_args(spec);
        debug!(instance = %spec.instance, image = %spec.image, "docker {}", args.join(" "));

        let child = Command::new(&self.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn container for image '{}'", spec.image))?;

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for container '{}'", spec.instance))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.code() == Some(DOCKER_RUN_FAILED) {
            anyhow::bail!(
                "docker could not start '{}' from '{}': {}",
                spec.instance,
                spec.image,
                stderr.trim()
            );
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        Ok(ContainerOutput {
            exit_code: output.status.code(),
            output: combined,
        })
    }

    async fn terminate(&self, instance: &str, grace: Duration) -> Result<()> {
        let seconds = grace.as_secs().to_string();
        self.capture(&["stop", "--time", &seconds, instance])
            .await
            .map(|_| ())
            .with_context(|| format!("Failed to stop container '{}'", instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Mount;

    #[test]
    fn test_run_args() {
        let spec = ContainerSpec {
            instance: "bioframe-step-1".to_string(),
            image: "bioframe-fastqc:latest".to_string(),
            command: "fastqc /data/a.fastq -o /data/out".to_string(),
            workdir: PathBuf::from("/data/out"),
            mounts: vec![Mount::read_write("/data"), Mount::read_only("/refs")],
            memory_gb: 4,
            cpus: 2,
        };

        let args = DockerCli::run_args(&spec);
        let joined = args.join(" ");

        assert!(joined.starts_with("run --rm --name bioframe-step-1 --memory 4g --cpus 2"));
        assert!(joined.contains("-v /data:/data:rw -v /refs:/refs:ro"));
        assert!(joined.contains("-w /data/out"));
        // The command stays a single argument so shell operators survive
        assert_eq!(args.last().unwrap(), "fastqc /data/a.fastq -o /data/out");
        assert_eq!(args[args.len() - 2], "-c");
    }

    #[cfg(unix)]
    fn fake_docker(dir: &Path, script: &str) -> PathBuf {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(format!("#!/bin/sh\n{}", script).as_bytes())
            .unwrap();
        file.sync_all().unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn spec_in(dir: &Path) -> ContainerSpec {
        ContainerSpec {
            instance: "bioframe-test-step1-1".to_string(),
            image: "bioframe-missing:latest".to_string(),
            command: "missing --help".to_string(),
            workdir: dir.to_path_buf(),
            mounts: vec![Mount::read_write(dir)],
            memory_gb: 2,
            cpus: 1,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_docker_failure_is_a_start_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let binary = fake_docker(
            temp.path(),
            "echo \"Unable to find image 'bioframe-missing:latest' locally\" >&2\nexit 125\n",
        );
        let docker = DockerCli::new(binary.display().to_string(), temp.path(), "bioframe-");

        let err = docker.run(&spec_in(temp.path())).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Unable to find image"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_exit_codes_pass_through() {
        let temp = tempfile::TempDir::new().unwrap();
        let binary = fake_docker(temp.path(), "echo 'sh: missing: not found' >&2\nexit 127\n");
        let docker = DockerCli::new(binary.display().to_string(), temp.path(), "bioframe-");

        let out = docker.run(&spec_in(temp.path())).await.unwrap();
        assert_eq!(out.exit_code, Some(127));
        assert!(out.output.contains("not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_docker_failure_earns_fallback_attempt() {
        use crate::core::runner::{
            CancelHandle, ExecutionError, ExecutionRequest, ExecutionRunner, ResourceTier,
            RunnerSettings,
        };
        use std::sync::Arc;

        let temp = tempfile::TempDir::new().unwrap();
        let binary = fake_docker(temp.path(), "echo 'Cannot connect to the Docker daemon' >&2\nexit 125\n");
        let runtime = Arc::new(DockerCli::new(
            binary.display().to_string(),
            temp.path(),
            "bioframe-",
        ));
        let runner = ExecutionRunner::new(runtime, RunnerSettings::default());

        let request = ExecutionRequest {
            instance: "bioframe-test-step1".to_string(),
            image: "bioframe-missing:latest".to_string(),
            output_dir: temp.path().join("out"),
            input_dirs: vec![],
            primary: ResourceTier::primary(8, 4),
            timeout: Duration::from_secs(30),
            max_output_bytes: 4096,
        };
        let raw = runner
            .run(&request, |_| "missing".to_string(), &CancelHandle::new())
            .await;

        assert_eq!(raw.attempts, 2);
        assert!(matches!(raw.error, Some(ExecutionError::Spawn { .. })));
        assert!(matches!(raw.fallback_reason, Some(ExecutionError::Spawn { .. })));
        assert!(raw.output.contains("Cannot connect"));
    }

    #[tokio::test]
    async fn test_build_definition_from_tools_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let tool_dir = temp.path().join("fastqc");
        std::fs::create_dir_all(&tool_dir).unwrap();
        std::fs::write(tool_dir.join("Dockerfile"), "FROM alpine\n").unwrap();

        let docker = DockerCli::new("docker", temp.path(), "bioframe-");
        let text = docker
            .build_definition("bioframe-fastqc:latest")
            .await
            .unwrap();
        assert_eq!(text, "FROM alpine\n");

        assert!(docker.build_definition("bioframe-missing:1").await.is_err());
    }
}
