//! Shared test support: an in-memory container runtime driven by scripts.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use bioframe::adapters::{ContainerOutput, ContainerRuntime, ContainerSpec};
use bioframe::core::{Orchestrator, RunnerSettings, ToolRegistry};

pub const PREFIX: &str = "bioframe-";

/// What a fake container does when run
#[derive(Debug, Clone)]
pub struct Action {
    pub exit_code: i32,
    pub output: String,
    /// Files written into the working directory, relative names
    pub files: Vec<(String, String)>,
    /// Block until terminated
    pub hang: bool,
}

impl Action {
    pub fn ok() -> Self {
        Self::exit(0)
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            output: String::new(),
            files: Vec::new(),
            hang: false,
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::exit(143)
        }
    }

    pub fn output(mut self, text: &str) -> Self {
        self.output = text.to_string();
        self
    }

    pub fn file(mut self, name: &str, content: &str) -> Self {
        self.files.push((name.to_string(), content.to_string()));
        self
    }
}

/// Scripted `ContainerRuntime`. Images are `bioframe-<tool>:latest`.
#[derive(Default)]
pub struct FakeRuntime {
    definitions: Mutex<Vec<(String, String)>>,
    scripts: Mutex<HashMap<String, VecDeque<Action>>>,
    defaults: Mutex<HashMap<String, Action>>,
    runs: Mutex<Vec<ContainerSpec>>,
    stopped: Notify,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn image(tool: &str) -> String {
        format!("{}{}:latest", PREFIX, tool)
    }

    /// Register a tool image with a template and extra `# key: value` lines
    pub fn add_tool(&self, tool: &str, template: &str, extra: &[(&str, &str)]) {
        let mut definition = format!(
            "FROM alpine:3.19\n\n# BIOFRAME_TOOL_METADATA\n# tool_name: {}\n# tool_primary_command: {}\n# tool_command_template: {}\n",
            tool, tool, template
        );
        for (key, value) in extra {
            definition.push_str(&format!("# {}: {}\n", key, value));
        }
        definition.push_str("#\n");

        self.add_image(&Self::image(tool), &definition);
    }

    pub fn add_image(&self, image: &str, definition: &str) {
        self.definitions
            .lock()
            .unwrap()
            .push((image.to_string(), definition.to_string()));
    }

    /// Action used whenever no scripted action is queued
    pub fn on(&self, tool: &str, action: Action) {
        self.defaults
            .lock()
            .unwrap()
            .insert(Self::image(tool), action);
    }

    /// Actions consumed in order before the default applies
    pub fn script(&self, tool: &str, actions: Vec<Action>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(Self::image(tool))
            .or_default()
            .extend(actions);
    }

    pub fn runs(&self) -> Vec<ContainerSpec> {
        self.runs.lock().unwrap().clone()
    }

    pub fn runs_of(&self, tool: &str) -> Vec<ContainerSpec> {
        let image = Self::image(tool);
        self.runs()
            .into_iter()
            .filter(|spec| spec.image == image)
            .collect()
    }

    fn next_action(&self, image: &str) -> Action {
        if let Some(action) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(image)
            .and_then(VecDeque::pop_front)
        {
            return action;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .unwrap_or_else(Action::ok)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let mut images: Vec<String> = self
            .definitions
            .lock()
            .unwrap()
            .iter()
            .map(|(image, _)| image.clone())
            .collect();
        images.push("ubuntu:22.04".to_string());
        Ok(images)
    }

    async fn build_definition(&self, image: &str) -> Result<String> {
        self.definitions
            .lock()
            .unwrap()
            .iter()
            .find(|(i, _)| i == image)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| anyhow::anyhow!("no build definition for {}", image))
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerOutput> {
        self.runs.lock().unwrap().push(spec.clone());
        let action = self.next_action(&spec.image);

        for (name, content) in &action.files {
            let path = spec.workdir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }

        if action.hang {
            self.stopped.notified().await;
        }

        Ok(ContainerOutput {
            exit_code: Some(action.exit_code),
            output: action.output,
        })
    }

    async fn terminate(&self, _instance: &str, _grace: Duration) -> Result<()> {
        self.stopped.notify_one();
        Ok(())
    }
}

/// Orchestrator over a fake runtime, storing runs under `runs_dir`
pub fn orchestrator(runtime: &Arc<FakeRuntime>, runs_dir: &Path) -> Orchestrator {
    let runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    let registry = Arc::new(ToolRegistry::new(Arc::clone(&runtime), PREFIX));
    Orchestrator::new(runtime, registry, runs_dir).with_runner_settings(RunnerSettings {
        grace_period_seconds: 0,
        ..Default::default()
    })
}

/// Create uploaded files with the given names under `dir`
pub fn uploads(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            std::fs::write(&path, format!("contents of {}", name)).unwrap();
            path
        })
        .collect()
}
