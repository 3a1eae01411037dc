use clap::{Parser, Subcommand};
use color_eyre::Result;

mod commands;
mod output;

#[derive(Parser, Debug)]
#[command(name = "stagehand", version, about = "Run declarative CI pipelines locally")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a pipeline
    Run(commands::run::RunArgs),
    /// Validate a pipeline file without running it
    Validate(commands::validate::ValidateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Validate(args) => commands::validate::execute(args),
    }
}
