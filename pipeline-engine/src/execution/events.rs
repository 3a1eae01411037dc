// Execution Events
// Progress reporting and event types for pipeline runs

use crate::execution::scheduler::JobState;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Pipeline run started
    PipelineStarted {
        pipeline_name: String,
        total_jobs: usize,
    },

    /// Pipeline run completed
    PipelineCompleted {
        pipeline_name: String,
        success: bool,
        duration: Duration,
    },

    /// Job was dispatched to the execution adapter
    JobStarted { job_name: String, stage: String },

    /// A line of job output (stdout/stderr)
    JobOutput {
        job_name: String,
        line: String,
        is_error: bool,
    },

    /// Job reached a terminal state
    JobCompleted {
        job_name: String,
        state: JobState,
        duration: Duration,
    },

    /// Job was skipped without executing
    JobSkipped { job_name: String, reason: String },

    /// Log message (info, warning, error)
    Log { level: LogLevel, message: String },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn pipeline_started(name: impl Into<String>, total_jobs: usize) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            total_jobs,
        }
    }

    pub fn pipeline_completed(name: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            success,
            duration,
        }
    }

    pub fn job_started(job_name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::JobStarted {
            job_name: job_name.into(),
            stage: stage.into(),
        }
    }

    pub fn job_output(job_name: impl Into<String>, line: impl Into<String>, is_error: bool) -> Self {
        Self::JobOutput {
            job_name: job_name.into(),
            line: line.into(),
            is_error,
        }
    }

    pub fn job_completed(job_name: impl Into<String>, state: JobState, duration: Duration) -> Self {
        Self::JobCompleted {
            job_name: job_name.into(),
            state,
            duration,
        }
    }

    pub fn job_skipped(job_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::JobSkipped {
            job_name: job_name.into(),
            reason: reason.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_channel_delivers_events_in_order() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::pipeline_started("checks", 2));
        tx.send_event(ExecutionEvent::job_started("lint", "build"));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::PipelineStarted { .. }));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ExecutionEvent::JobStarted { .. }));
    }

    #[test]
    fn event_construction() {
        let event =
            ExecutionEvent::job_completed("lint", JobState::Succeeded, Duration::from_secs(12));

        if let ExecutionEvent::JobCompleted {
            job_name,
            state,
            duration,
        } = event
        {
            assert_eq!(job_name, "lint");
            assert_eq!(state, JobState::Succeeded);
            assert_eq!(duration, Duration::from_secs(12));
        } else {
            panic!("wrong event type");
        }
    }

    #[test]
    fn absent_sender_is_a_no_op() {
        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::info("test"));
    }
}
