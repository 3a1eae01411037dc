// Execution Module
// Handles graph construction, scheduling, and result aggregation

pub mod events;
pub mod graph;
pub mod report;
pub mod scheduler;

// Re-export key types
pub use events::{progress_channel, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use graph::{GraphNode, PipelineGraph, RunOptions};
pub use report::{JobReport, PipelineResult, Verdict};
pub use scheduler::{CancelHandle, JobState, Scheduler, SchedulerConfig};
