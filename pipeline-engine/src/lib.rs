// Pipeline Engine Library
// Core library for declarative pipeline parsing and execution

pub mod execution;
pub mod parser;
pub mod runners;

// Re-export parser types
pub use parser::{
    AllowFailure, ArtifactPolicy, ArtifactWhen, ConfigError, Job, Pipeline, PipelineLoader,
};

// Re-export execution types
pub use execution::{
    progress_channel, CancelHandle, ExecutionEvent, GraphNode, JobReport, JobState, LogLevel,
    PipelineGraph, PipelineResult, ProgressReceiver, ProgressSender, RunOptions, Scheduler,
    SchedulerConfig, Verdict,
};

// Re-export runner types
pub use runners::{JobOutcome, JobRunner, RunId, RunRequest, RunnerError, ShellRunner};
