// Result Aggregation
// Folds per-job runs into one pipeline verdict and summary

use crate::execution::scheduler::JobState;

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Failed,
}

/// Final record for one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub name: String,
    pub stage: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub failure_allowed: bool,
    pub reason: Option<String>,
    pub duration_ms: u64,
    pub artifacts: Vec<PathBuf>,
}

impl JobReport {
    /// A failure tolerated by the job's policy.
    pub fn is_warning(&self) -> bool {
        self.state == JobState::Failed && self.failure_allowed
    }

    /// A failure or skip that counts against the pipeline.
    pub fn is_fatal(&self) -> bool {
        match self.state {
            JobState::Failed => !self.failure_allowed,
            JobState::Skipped => true,
            _ => false,
        }
    }
}

/// Aggregate of all job runs for one pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub verdict: Verdict,
    pub jobs: Vec<JobReport>,
    pub duration_ms: u64,
}

impl PipelineResult {
    /// Fold job reports into a verdict. Failed iff any job failed without
    /// permission or was skipped on the way.
    pub fn new(pipeline: String, jobs: Vec<JobReport>, duration: Duration) -> Self {
        let verdict = if jobs.iter().any(JobReport::is_fatal) {
            Verdict::Failed
        } else {
            Verdict::Succeeded
        };
        Self {
            pipeline,
            verdict,
            jobs,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.verdict == Verdict::Succeeded
    }

    /// Process exit status for the run.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    /// Jobs that failed but were allowed to.
    pub fn warnings(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| j.is_warning())
    }

    /// Jobs that never executed.
    pub fn skipped(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| j.state == JobState::Skipped)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}
