//! Command synthesis: expand a tool's template into a literal command line.
//!
//! Missing data never errors. A placeholder with nothing to substitute
//! (e.g. `{input_file_2}` with one input) expands to the empty string and the
//! resulting command is left to fail at execution time.

use std::path::{Path, PathBuf};

use crate::domain::{CommandTemplate, Placeholder};

/// Thread count used when neither the step nor the tool sets one
pub const DEFAULT_THREADS: u32 = 4;

/// Memory (GB) used when neither the step nor the tool sets one
pub const DEFAULT_MEMORY_GB: u32 = 8;

/// Values available to placeholders for a single step attempt
#[derive(Debug, Clone)]
pub struct SynthesisContext {
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub threads: Option<u32>,
    pub memory_gb: Option<u32>,
}

impl SynthesisContext {
    pub fn new(inputs: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            output_dir: output_dir.into(),
            threads: None,
            memory_gb: None,
        }
    }

    pub fn with_resources(mut self, threads: u32, memory_gb: u32) -> Self {
        self.threads = Some(threads);
        self.memory_gb = Some(memory_gb);
        self
    }

    /// The Nth input (1-based), empty if absent
    fn input(&self, n: usize) -> String {
        n.checked_sub(1)
            .and_then(|i| self.inputs.get(i))
            .map(|p| path_str(p))
            .unwrap_or_default()
    }

    fn all_inputs(&self) -> String {
        self.inputs
            .iter()
            .map(|p| path_str(p))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Substitution value for one placeholder
    pub fn value_of(&self, placeholder: Placeholder) -> String {
        match placeholder {
            Placeholder::InputFiles | Placeholder::AssemblyFiles => self.all_inputs(),
            Placeholder::InputFile(n) => self.input(n),
            Placeholder::Read1 | Placeholder::Reference => self.input(1),
            Placeholder::Read2 => self.input(2),
            Placeholder::OutputDir => path_str(&self.output_dir),
            Placeholder::Threads => self.threads.unwrap_or(DEFAULT_THREADS).to_string(),
            Placeholder::Memory => self.memory_gb.unwrap_or(DEFAULT_MEMORY_GB).to_string(),
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Expand `template` against `ctx` in a single pass over its tokens
pub fn synthesize(template: &CommandTemplate, ctx: &SynthesisContext) -> String {
    template.render(|placeholder| ctx.value_of(placeholder))
}
