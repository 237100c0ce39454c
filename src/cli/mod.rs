//! Command-line interface for bioframe.
//!
//! Provides commands for listing discovered tools, running pipelines,
//! inspecting and deleting runs, and rerunning or resuming them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::{self, ResolvedConfig};
use crate::core::{CancelHandle, Orchestrator, Pipeline};
use crate::domain::{PipelineRun, RunState, StepStatus};

/// bioframe - Containerized bioinformatics pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "bioframe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List tools discovered from local images
    Tools {
        /// Ignore the cache and scan images again
        #[arg(long)]
        rescan: bool,

        /// Print full metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a pipeline over input files
    Run {
        /// Comma-separated tool names, in execution order
        #[arg(short, long, value_delimiter = ',', conflicts_with = "pipeline", required_unless_present = "pipeline")]
        tools: Vec<String>,

        /// Pipeline definition file (YAML)
        #[arg(short, long)]
        pipeline: Option<PathBuf>,

        /// Input files, in upload order
        #[arg(short, long, num_args = 1.., required = true)]
        input: Vec<PathBuf>,

        /// Keep running after a step fails
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Execution summary and categorized issues of a run
    Report {
        /// Run ID (UUID)
        run_id: String,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a run with its logs and step outputs
    Delete {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Rerun a run starting at a given step
    Rerun {
        /// Run ID to rerun
        run_id: String,

        /// 1-based step to restart from
        #[arg(long = "from")]
        from_step: usize,
    },

    /// Resume a failed or cancelled run
    Resume {
        /// Run ID to resume
        run_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Tools { rescan, json } => list_tools(rescan, json).await,
            Commands::Run {
                tools,
                pipeline,
                input,
                continue_on_error,
            } => run_pipeline(tools, pipeline, input, continue_on_error).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Report { run_id, json } => show_report(&run_id, json).await,
            Commands::Delete { run_id } => delete_run(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Rerun { run_id, from_step } => rerun(&run_id, Some(from_step)).await,
            Commands::Resume { run_id } => rerun(&run_id, None).await,
            Commands::Config => show_config(),
        }
    }
}

fn orchestrator() -> Result<(Orchestrator, &'static ResolvedConfig)> {
    let cfg = config::config()?;
    Ok((Orchestrator::from_config(cfg).with_input_staging(true), cfg))
}

fn parse_run_id(run_id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))
}

/// Cancel handle that fires on Ctrl-C
fn cancel_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[Cancelling; waiting for the running container to stop...]");
            trigger.cancel();
        }
    });
    cancel
}

async fn list_tools(rescan: bool, json: bool) -> Result<()> {
    let (orchestrator, _) = orchestrator()?;
    let registry = orchestrator.registry();
    let tools = if rescan {
        registry.rescan().await?
    } else {
        registry.discover().await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&*tools)?);
        return Ok(());
    }

    if tools.is_empty() {
        println!(
            "No tools found (images must be named {}<tool>:<tag>)",
            registry.image_prefix()
        );
        return Ok(());
    }

    println!("{:<16} {:<32} {:<14} {:<8}", "TOOL", "IMAGE", "CATEGORY", "RESOURCES");
    println!("{}", "-".repeat(80));

    for (name, tool) in tools.iter() {
        println!(
            "{:<16} {:<32} {:<14} {}GB/{}cpu",
            name, tool.image, tool.metadata.category, tool.metadata.memory_gb, tool.metadata.cpus
        );
    }

    Ok(())
}

async fn run_pipeline(
    tools: Vec<String>,
    pipeline_file: Option<PathBuf>,
    inputs: Vec<PathBuf>,
    continue_on_error: bool,
) -> Result<()> {
    let (orchestrator, cfg) = orchestrator()?;

    let mut pipeline = match pipeline_file {
        Some(path) => Pipeline::from_file(&path)?,
        None => {
            let mut pipeline = Pipeline::from_tools(&tools.join("-"), &tools);
            pipeline.safety_limits = cfg.safety.clone();
            pipeline
        }
    };
    if continue_on_error {
        pipeline.policy.continue_on_error = true;
    }

    let inputs = inputs
        .iter()
        .map(|p| {
            p.canonicalize()
                .with_context(|| format!("Input file not found: {}", p.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let run = orchestrator
        .run_pipeline(&pipeline, inputs, &cancel_on_ctrl_c())
        .await?;

    report(&run)
}

async fn rerun(run_id_str: &str, from_step: Option<usize>) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (orchestrator, _) = orchestrator()?;
    let cancel = cancel_on_ctrl_c();

    let run = match from_step {
        Some(step) => orchestrator.rerun_from(run_id, step, &cancel).await?,
        None => orchestrator.resume_run(run_id, &cancel).await?,
    };

    report(&run)
}

/// Print the outcome of a finished run and exit non-zero unless it succeeded
fn report(run: &PipelineRun) -> Result<()> {
    if let Some(last) = run.steps.iter().rev().find(|s| s.status.is_terminal()) {
        if let Some(dir) = &last.output_dir {
            eprintln!("Last output: {}", dir.display());
        }
    }

    match &run.state {
        RunState::Succeeded => {
            eprintln!("\n[Run {} completed successfully]", run.id);
        }
        RunState::NeedsReview { steps } => {
            eprintln!(
                "\n[Run {} completed; step(s) {:?} need review]",
                run.id, steps
            );
        }
        RunState::Failed { error } => {
            eprintln!("\n[Run {} failed: {}]", run.id, error);
            std::process::exit(1);
        }
        RunState::Cancelled => {
            eprintln!("\n[Run {} cancelled; resume with `bioframe resume {}`]", run.id, run.id);
            std::process::exit(130);
        }
        RunState::SafetyLimitReached { limit } => {
            eprintln!("\n[Run {} stopped: safety limit reached - {}]", run.id, limit);
            std::process::exit(1);
        }
        RunState::Running => {
            eprintln!("\n[Run {} in state: {}]", run.id, run.state.label());
        }
    }

    Ok(())
}

async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (orchestrator, _) = orchestrator()?;
    let run = orchestrator.get_run_status(run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline.name);
    println!("State: {}", run.state.label());
    match &run.state {
        RunState::Failed { error } => println!("Error: {}", error),
        RunState::SafetyLimitReached { limit } => println!("Limit: {}", limit),
        _ => {}
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }

    println!("\nInputs:");
    for input in &run.original_inputs {
        println!("  {}", input.display());
    }

    println!("\nSteps:");
    for step in &run.steps {
        let marker = match step.status {
            StepStatus::Ambiguous => " (needs review)",
            _ => "",
        };
        println!("  {}. {}: {:?}{}", step.index, step.tool, step.status, marker);
        if let Some(result) = &step.result {
            println!(
                "     attempts: {}, exit: {}, {}ms{}",
                result.attempts,
                result
                    .exit_code
                    .map_or_else(|| "none".to_string(), |c| c.to_string()),
                result.duration_ms,
                if result.timed_out { ", timed out" } else { "" }
            );
            println!("     reason: {}", result.reason);
            if let Some(log) = &result.log_path {
                println!("     log: {}", log.display());
            }
        }
        if !step.outputs.is_empty() {
            println!("     outputs: {}", step.outputs.len());
        }
    }

    Ok(())
}

async fn show_report(run_id_str: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (orchestrator, _) = orchestrator()?;
    let summary = orchestrator.summarize_run(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }

    Ok(())
}

async fn delete_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (orchestrator, _) = orchestrator()?;

    orchestrator.delete_run(run_id).await?;
    println!("Deleted run {}", run_id);

    Ok(())
}

async fn list_runs(limit: usize) -> Result<()> {
    let (orchestrator, _) = orchestrator()?;
    let runs = orchestrator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<14} {:<20}", "RUN ID", "PIPELINE", "STATE", "STARTED");
    println!("{}", "-".repeat(96));

    for run in runs {
        println!(
            "{:<38} {:<24} {:<14} {:<20}",
            run.id,
            run.pipeline.name,
            run.state.label(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("bioframe configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Runs:                {}", cfg.runs_dir().display());
    println!("  Tools:               {}", cfg.tools_dir.display());
    println!();
    println!("Runtime:");
    println!("  Binary:        {}", cfg.runtime.binary);
    println!("  Image prefix:  {}", cfg.image_prefix);
    println!("  Grace period:  {}s", cfg.runtime.runner.grace_period_seconds);
    println!(
        "  Fallback tier: memory / {}, {} CPU",
        cfg.runtime.runner.fallback_memory_divisor, cfg.runtime.runner.fallback_cpus
    );
    println!();
    println!("Safety limits:");
    println!("  Max steps:      {}", cfg.safety.max_steps);
    println!("  Step timeout:   {}s", cfg.safety.step_timeout_seconds);
    println!("  Run timeout:    {}s", cfg.safety.run_timeout_seconds);
    println!("  Max log bytes:  {}", cfg.safety.max_output_bytes);

    Ok(())
}
