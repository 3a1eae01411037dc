use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{PipelineGraph, PipelineLoader, RunOptions};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    output::status("Validating", &format!("{}", pipeline_path.display()));

    let pipeline = match PipelineLoader::parse_file(pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            output::error(&format!("{}", e));
            std::process::exit(1);
        }
    };

    output::check("YAML syntax valid");
    output::check(&format!(
        "Structure: {} stages, {} jobs",
        pipeline.stage_order().len(),
        pipeline.jobs.len()
    ));

    // Resolve everything, optional jobs included, to surface cycles
    let options = RunOptions {
        include_optional: true,
        include: Vec::new(),
    };
    match PipelineGraph::from_pipeline(&pipeline, &options) {
        Ok(graph) => {
            output::check(&format!(
                "Dependency graph resolved: {} runnable jobs",
                graph.len()
            ));
        }
        Err(e) => {
            output::error(&format!("{}", e));
            std::process::exit(1);
        }
    }

    println!();
    output::success("Pipeline is valid");

    Ok(())
}
