use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::execution::events::{progress_channel, LogLevel};
use pipeline_engine::{
    ExecutionEvent, JobState, PipelineGraph, PipelineLoader, RunOptions, Scheduler,
    SchedulerConfig, ShellRunner,
};

/// Run a pipeline from a YAML file
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Set a variable (can be repeated, format: name=value)
    #[arg(long = "var", short = 'v', value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Working directory for job scripts
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Maximum concurrently running jobs (0 = unbounded)
    #[arg(long, short = 'j', value_name = "N", default_value_t = 0)]
    pub max_parallel: usize,

    /// Per-job timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Grace period in seconds for cancelled jobs
    #[arg(long, value_name = "SECONDS", default_value_t = 5)]
    pub grace: u64,

    /// Include every optional job in the run
    #[arg(long)]
    pub include_optional: bool,

    /// Include a specific optional job (can be repeated)
    #[arg(long, value_name = "JOB")]
    pub include: Vec<String>,

    /// Print the result summary as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    output::status("Loading", &format!("{}", pipeline_path.display()));
    let mut pipeline = PipelineLoader::parse_file(pipeline_path)?;

    // Variables from --var flags override pipeline-level ones
    for var_str in &args.variables {
        if let Some((name, value)) = var_str.split_once('=') {
            pipeline
                .variables
                .insert(name.to_string(), value.to_string());
        } else {
            color_eyre::eyre::bail!("Invalid variable format '{}'. Expected name=value", var_str);
        }
    }

    let options = RunOptions {
        include_optional: args.include_optional,
        include: args.include.clone(),
    };
    let graph = PipelineGraph::from_pipeline(&pipeline, &options)?;

    output::info(&format!(
        "Pipeline '{}': {} stages, {} jobs selected",
        graph.pipeline_name(),
        pipeline.stage_order().len(),
        graph.len()
    ));

    let (tx, mut rx) = progress_channel();
    let mut runner = ShellRunner::new(&working_dir).with_progress(tx.clone());
    if let Some(timeout) = args.timeout {
        runner = runner.with_timeout(Duration::from_secs(timeout));
    }

    let scheduler = Scheduler::new(graph, Arc::new(runner))
        .with_config(SchedulerConfig {
            max_parallel: args.max_parallel,
            cancel_grace: Duration::from_secs(args.grace),
        })
        .with_progress(tx);

    // First Ctrl-C requests a graceful stop
    let cancel = scheduler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupt received, cancelling pipeline");
            cancel.cancel();
        }
    });

    let exec_handle = tokio::spawn(scheduler.run());

    while let Some(event) = rx.recv().await {
        match &event {
            ExecutionEvent::PipelineStarted {
                pipeline_name,
                total_jobs,
            } => {
                println!();
                output::header(&format!("Pipeline '{}' ({} jobs)", pipeline_name, total_jobs));
            }

            ExecutionEvent::JobStarted { job_name, stage } => {
                println!("    [{}] {}", stage, job_name);
            }

            ExecutionEvent::JobOutput {
                line, is_error, ..
            } => {
                if *is_error {
                    output::job_error(line);
                } else {
                    output::job_output(line);
                }
            }

            ExecutionEvent::JobCompleted {
                job_name,
                state,
                duration,
            } => {
                let symbol = match state {
                    JobState::Succeeded => "OK",
                    JobState::Failed => "FAIL",
                    _ => "DONE",
                };
                let line = format!(
                    "    Job '{}' {} ({:.2}s)",
                    job_name,
                    symbol,
                    duration.as_secs_f64()
                );
                if *state == JobState::Succeeded {
                    output::dim_success(&line);
                } else {
                    output::dim_failure(&line);
                }
            }

            ExecutionEvent::JobSkipped { job_name, reason } => {
                output::warning(&format!("    Job '{}' skipped: {}", job_name, reason));
            }

            ExecutionEvent::Log { level, message } => match level {
                LogLevel::Error => output::error(message),
                LogLevel::Warning => output::warning(message),
                _ => output::dim(message),
            },

            ExecutionEvent::PipelineCompleted {
                success, duration, ..
            } => {
                println!();
                if *success {
                    output::success(&format!(
                        "Pipeline completed successfully in {:.2}s",
                        duration.as_secs_f64()
                    ));
                } else {
                    output::failure(&format!(
                        "Pipeline failed after {:.2}s",
                        duration.as_secs_f64()
                    ));
                }
            }
        }
    }

    let result = exec_handle.await?;

    for job in result.warnings() {
        output::warning(&format!(
            "Job '{}' failed but was allowed to (exit code: {:?})",
            job.name, job.exit_code
        ));
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    std::process::exit(result.exit_code());
}
