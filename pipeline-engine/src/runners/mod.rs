// Execution adapters
// The scheduler talks to whatever actually runs a job through this boundary

pub mod shell;

pub use shell::ShellRunner;

use crate::parser::models::Job;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Opaque identifier for one dispatched job, used to target cancellation.
pub type RunId = u64;

/// Everything an adapter needs to execute one job.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    pub job: Job,
    /// Fully merged environment (pipeline variables, job variables, built-ins)
    pub env: HashMap<String, String>,
}

/// What an adapter reports back when a job finishes.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// None when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Artifact paths collected after the job finished
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to launch job: {0}")]
    Launch(String),
    #[error("job timed out after {0} seconds")]
    Timeout(u64),
    #[error("i/o error while running job: {0}")]
    Io(#[from] std::io::Error),
}

/// Boundary between the scheduler and the thing that actually runs jobs.
/// The scheduler never inspects how a job executes; it hands over a request
/// and awaits an outcome.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, request: RunRequest) -> Result<JobOutcome, RunnerError>;

    /// Best-effort cancellation of a running job. The scheduler still waits
    /// for the job's completion to come back through `run`.
    async fn cancel(&self, run_id: RunId);
}
