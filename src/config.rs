//! Configuration for bioframe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (BIOFRAME_HOME, BIOFRAME_TOOLS_DIR, BIOFRAME_DOCKER)
//! 2. Config file (.bioframe/config.yaml)
//! 3. Defaults (~/.bioframe, ./tools, docker)
//!
//! Config file discovery:
//! - Searches current directory and parents for .bioframe/config.yaml
//! - Paths in config file are relative to the project root (the parent of .bioframe/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::resolver::ReferenceRules;
use crate::core::runner::RunnerSettings;
use crate::core::safety::SafetyLimits;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Default image prefix: images are named `bioframe-<tool>:<tag>`
pub const DEFAULT_IMAGE_PREFIX: &str = "bioframe-";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub images: Option<ImagesConfig>,
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
    #[serde(default)]
    pub reference: Option<ReferenceRules>,
    #[serde(default)]
    pub safety: Option<SafetyLimits>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to project root)
    pub home: Option<String>,
    /// Directory holding `<tool>/Dockerfile` (relative to project root)
    pub tools: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub binary: Option<String>,
    #[serde(flatten)]
    pub runner: RunnerSettings,
}

/// Container runtime settings
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Container CLI binary
    pub binary: String,
    /// Grace period, fallback tier and exhaustion signatures
    pub runner: RunnerSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            runner: RunnerSettings::default(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to bioframe home (engine state)
    pub home: PathBuf,
    /// Directory containing tool build definitions
    pub tools_dir: PathBuf,
    /// Prefix that makes an image visible to discovery
    pub image_prefix: String,
    pub runtime: RuntimeSettings,
    /// Reference-file heuristic lists
    pub reference: ReferenceRules,
    /// Default safety limits for pipelines built on the command line
    pub safety: SafetyLimits,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Get the runs directory (<home>/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".bioframe").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed config file with environment overrides
fn resolve(
    config: Option<ConfigFile>,
    config_file: Option<PathBuf>,
    default_home: PathBuf,
) -> ResolvedConfig {
    // Project root is the parent of .bioframe/ (i.e., grandparent of config.yaml)
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let paths = config
        .as_ref()
        .map(|c| c.paths.clone())
        .unwrap_or_default();

    let home = if let Ok(env_home) = std::env::var("BIOFRAME_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = paths.home {
        resolve_path(&base_dir, home_path)
    } else {
        default_home
    };

    let tools_dir = if let Ok(env_tools) = std::env::var("BIOFRAME_TOOLS_DIR") {
        PathBuf::from(env_tools)
    } else if let Some(ref tools_path) = paths.tools {
        resolve_path(&base_dir, tools_path)
    } else {
        base_dir.join("tools")
    };

    let image_prefix = config
        .as_ref()
        .and_then(|c| c.images.as_ref())
        .and_then(|i| i.prefix.clone())
        .unwrap_or_else(|| DEFAULT_IMAGE_PREFIX.to_string());

    let mut runtime = RuntimeSettings::default();
    if let Some(rt) = config.as_ref().and_then(|c| c.runtime.clone()) {
        if let Some(binary) = rt.binary {
            runtime.binary = binary;
        }
        runtime.runner = rt.runner;
    }
    if let Ok(binary) = std::env::var("BIOFRAME_DOCKER") {
        runtime.binary = binary;
    }

    let reference = config
        .as_ref()
        .and_then(|c| c.reference.clone())
        .unwrap_or_default();

    let safety = config
        .as_ref()
        .and_then(|c| c.safety.clone())
        .unwrap_or_default();

    ResolvedConfig {
        home,
        tools_dir,
        image_prefix,
        runtime,
        reference,
        safety,
        config_file,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".bioframe");

    let config_file = find_config_file();
    let config = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    Ok(resolve(config, config_file, default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
