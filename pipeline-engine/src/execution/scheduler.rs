// Pipeline Scheduler
// Single decision loop driving every job to a terminal state

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::PipelineGraph;
use crate::execution::report::{JobReport, PipelineResult};
use crate::runners::{JobOutcome, JobRunner, RunId, RunRequest, RunnerError};

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Lifecycle of one job within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped
        )
    }
}

/// One execution attempt of a job. Created at dispatch time, mutated only
/// by the scheduler's decision loop, summarized into the pipeline result.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub name: String,
    pub state: JobState,
    pub run_id: Option<RunId>,
    pub exit_code: Option<i32>,
    pub artifacts: Vec<PathBuf>,
    pub reason: Option<String>,
    pub failure_allowed: bool,
    started_at: Option<Instant>,
    pub duration: Duration,
}

impl JobRun {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: JobState::Pending,
            run_id: None,
            exit_code: None,
            artifacts: Vec::new(),
            reason: None,
            failure_allowed: false,
            started_at: None,
            duration: Duration::ZERO,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrently running jobs (0 = unbounded)
    pub max_parallel: usize,
    /// How long cancelled jobs may keep running before being force-failed
    pub cancel_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Handle for cancelling a pipeline run from outside the scheduler.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

type Completion = (String, Result<JobOutcome, RunnerError>);

/// Drives a resolved pipeline graph to completion through an execution
/// adapter, honoring dependency order and the concurrency bound. All job
/// state lives in one table owned by the decision loop; adapter calls fan
/// out as tasks and report back over a channel.
pub struct Scheduler<R: JobRunner> {
    graph: PipelineGraph,
    runner: Arc<R>,
    config: SchedulerConfig,
    event_tx: Option<ProgressSender>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl<R: JobRunner + 'static> Scheduler<R> {
    pub fn new(graph: PipelineGraph, runner: Arc<R>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            graph,
            runner,
            config: SchedulerConfig::default(),
            event_tx: None,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Drive every job to a terminal state and fold the outcome.
    pub async fn run(self) -> PipelineResult {
        let start = Instant::now();
        let mut table: HashMap<String, JobRun> = self
            .graph
            .jobs()
            .map(|node| (node.job.name.clone(), JobRun::pending(&node.job.name)))
            .collect();

        self.event_tx.send_event(ExecutionEvent::pipeline_started(
            self.graph.pipeline_name(),
            table.len(),
        ));

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut cancel_rx = self.cancel_rx.clone();
        let mut running = 0usize;
        let mut next_run_id: RunId = 1;

        loop {
            self.settle(&mut table);
            running += self.dispatch(&mut table, &mut next_run_id, &done_tx, running);

            if running == 0 && table.values().all(|run| run.state.is_terminal()) {
                break;
            }

            tokio::select! {
                Some(completion) = done_rx.recv() => {
                    self.record(&mut table, completion, false);
                    running -= 1;
                }
                _ = cancel_rx.changed() => {
                    self.skip_unstarted(&mut table, "cancelled");
                    self.drain_cancelled(&mut table, &mut done_rx, running).await;
                    break;
                }
            }
        }

        let result = self.aggregate(table, start.elapsed());
        self.event_tx.send_event(ExecutionEvent::pipeline_completed(
            self.graph.pipeline_name(),
            result.succeeded(),
            result.duration(),
        ));
        result
    }

    /// Promote Pending jobs whose prerequisites all settled, and skip jobs
    /// whose prerequisites failed without permission or were themselves
    /// skipped. Skips cascade, so loop to a fixpoint.
    fn settle(&self, table: &mut HashMap<String, JobRun>) {
        loop {
            let mut changed = false;
            let pending: Vec<String> = table
                .iter()
                .filter(|(_, run)| run.state == JobState::Pending)
                .map(|(name, _)| name.clone())
                .collect();

            for name in pending {
                let Some(node) = self.graph.get(&name) else {
                    continue;
                };

                let mut skip_reason = None;
                let mut all_settled = true;
                for dep in &node.prereqs {
                    let Some(dep_run) = table.get(dep) else {
                        continue;
                    };
                    match dep_run.state {
                        JobState::Failed if !dep_run.failure_allowed => {
                            skip_reason = Some(format!("dependency '{}' failed", dep));
                            break;
                        }
                        JobState::Skipped => {
                            skip_reason = Some(format!("dependency '{}' was skipped", dep));
                            break;
                        }
                        state if !state.is_terminal() => all_settled = false,
                        _ => {}
                    }
                }

                if let Some(reason) = skip_reason {
                    if let Some(run) = table.get_mut(&name) {
                        run.state = JobState::Skipped;
                        run.reason = Some(reason.clone());
                    }
                    self.event_tx
                        .send_event(ExecutionEvent::job_skipped(&name, reason));
                    changed = true;
                } else if all_settled {
                    if let Some(run) = table.get_mut(&name) {
                        run.state = JobState::Ready;
                    }
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Launch Ready jobs while concurrency slots are free. Returns the
    /// number launched.
    fn dispatch(
        &self,
        table: &mut HashMap<String, JobRun>,
        next_run_id: &mut RunId,
        done_tx: &mpsc::UnboundedSender<Completion>,
        running: usize,
    ) -> usize {
        let ready: Vec<String> = self
            .graph
            .jobs()
            .filter(|node| {
                table.get(&node.job.name).map(|run| run.state) == Some(JobState::Ready)
            })
            .map(|node| node.job.name.clone())
            .collect();

        let mut launched = 0;
        for name in ready {
            if self.config.max_parallel != 0 && running + launched >= self.config.max_parallel {
                break;
            }
            let Some(node) = self.graph.get(&name) else {
                continue;
            };

            let run_id = *next_run_id;
            *next_run_id += 1;

            if let Some(run) = table.get_mut(&name) {
                run.state = JobState::Running;
                run.run_id = Some(run_id);
                run.started_at = Some(Instant::now());
            }
            self.event_tx
                .send_event(ExecutionEvent::job_started(&name, &node.job.stage));

            let request = RunRequest {
                run_id,
                job: node.job.clone(),
                env: self.graph.job_env(&node.job),
            };
            let runner = Arc::clone(&self.runner);
            let tx = done_tx.clone();
            tokio::spawn(async move {
                let outcome = runner.run(request).await;
                let _ = tx.send((name, outcome));
            });
            launched += 1;
        }
        launched
    }

    /// Record one adapter completion into the run table.
    fn record(&self, table: &mut HashMap<String, JobRun>, completion: Completion, cancelled: bool) {
        let (name, outcome) = completion;
        let Some(run) = table.get_mut(&name) else {
            return;
        };
        run.duration = run.started_at.map(|t| t.elapsed()).unwrap_or_default();

        match outcome {
            Ok(outcome) => {
                run.exit_code = outcome.exit_code;
                run.artifacts = outcome.artifacts;
                if outcome.exit_code == Some(0) {
                    run.state = JobState::Succeeded;
                } else {
                    run.state = JobState::Failed;
                    run.failure_allowed = self.failure_allowed(&name, outcome.exit_code);
                    run.reason = Some(if cancelled {
                        "cancelled".to_string()
                    } else {
                        match outcome.exit_code {
                            Some(code) => format!("exit code {}", code),
                            None => "terminated by signal".to_string(),
                        }
                    });
                }
            }
            Err(err) => {
                run.state = JobState::Failed;
                run.failure_allowed = self.failure_allowed(&name, None);
                run.reason = Some(if cancelled {
                    "cancelled".to_string()
                } else {
                    err.to_string()
                });
            }
        }

        let state = run.state;
        let duration = run.duration;
        self.event_tx
            .send_event(ExecutionEvent::job_completed(&name, state, duration));
    }

    fn failure_allowed(&self, name: &str, exit_code: Option<i32>) -> bool {
        self.graph
            .get(name)
            .map(|node| node.job.allow_failure.permits(exit_code))
            .unwrap_or(false)
    }

    /// Skip everything that has not been dispatched yet.
    fn skip_unstarted(&self, table: &mut HashMap<String, JobRun>, reason: &str) {
        for run in table.values_mut() {
            if matches!(run.state, JobState::Pending | JobState::Ready) {
                run.state = JobState::Skipped;
                run.reason = Some(reason.to_string());
                self.event_tx
                    .send_event(ExecutionEvent::job_skipped(&run.name, reason));
            }
        }
    }

    /// Ask the adapter to cancel running jobs, give them the grace period
    /// to report, then force-fail the stragglers.
    async fn drain_cancelled(
        &self,
        table: &mut HashMap<String, JobRun>,
        done_rx: &mut mpsc::UnboundedReceiver<Completion>,
        mut running: usize,
    ) {
        let active: Vec<RunId> = table
            .values()
            .filter(|run| run.state == JobState::Running)
            .filter_map(|run| run.run_id)
            .collect();
        for run_id in active {
            self.runner.cancel(run_id).await;
        }

        let deadline = tokio::time::sleep(self.config.cancel_grace);
        tokio::pin!(deadline);

        while running > 0 {
            tokio::select! {
                Some(completion) = done_rx.recv() => {
                    self.record(table, completion, true);
                    running -= 1;
                }
                _ = &mut deadline => break,
            }
        }

        for run in table.values_mut() {
            if run.state == JobState::Running {
                run.state = JobState::Failed;
                run.reason = Some("cancelled".to_string());
                run.duration = run.started_at.map(|t| t.elapsed()).unwrap_or_default();
                self.event_tx.send_event(ExecutionEvent::job_completed(
                    &run.name,
                    JobState::Failed,
                    run.duration,
                ));
            }
        }
    }

    /// Fold the run table into the pipeline result, in declaration order.
    fn aggregate(&self, table: HashMap<String, JobRun>, duration: Duration) -> PipelineResult {
        let reports: Vec<JobReport> = self
            .graph
            .jobs()
            .filter_map(|node| {
                table.get(&node.job.name).map(|run| JobReport {
                    name: run.name.clone(),
                    stage: node.job.stage.clone(),
                    state: run.state,
                    exit_code: run.exit_code,
                    failure_allowed: run.failure_allowed,
                    reason: run.reason.clone(),
                    duration_ms: run.duration.as_millis() as u64,
                    artifacts: run.artifacts.clone(),
                })
            })
            .collect();

        PipelineResult::new(self.graph.pipeline_name().to_string(), reports, duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::graph::RunOptions;
    use crate::parser::models::{AllowFailure, Job, Pipeline};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct FakeRunner {
        exit_codes: HashMap<String, i32>,
        delays: HashMap<String, Duration>,
        hang: HashSet<String>,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        cancelled: Mutex<Vec<RunId>>,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                exit_codes: HashMap::new(),
                delays: HashMap::new(),
                hang: HashSet::new(),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                cancelled: Mutex::new(Vec::new()),
            }
        }

        fn failing(mut self, name: &str, code: i32) -> Self {
            self.exit_codes.insert(name.to_string(), code);
            self
        }

        fn delayed(mut self, name: &str, ms: u64) -> Self {
            self.delays
                .insert(name.to_string(), Duration::from_millis(ms));
            self
        }

        fn hanging(mut self, name: &str) -> Self {
            self.hang.insert(name.to_string());
            self
        }
    }

    #[async_trait::async_trait]
    impl JobRunner for FakeRunner {
        async fn run(&self, request: RunRequest) -> Result<JobOutcome, RunnerError> {
            if self.hang.contains(&request.job.name) {
                std::future::pending::<()>().await;
            }

            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(&request.job.name) {
                tokio::time::sleep(*delay).await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let code = self
                .exit_codes
                .get(&request.job.name)
                .copied()
                .unwrap_or(0);
            Ok(JobOutcome {
                exit_code: Some(code),
                artifacts: Vec::new(),
            })
        }

        async fn cancel(&self, run_id: RunId) {
            self.cancelled.lock().await.push(run_id);
        }
    }

    fn job(name: &str, stage: &str) -> Job {
        Job {
            name: name.to_string(),
            stage: stage.to_string(),
            script: vec!["true".to_string()],
            ..Default::default()
        }
    }

    fn graph(stages: &[&str], jobs: Vec<Job>) -> PipelineGraph {
        let pipeline = Pipeline {
            name: Some("test".to_string()),
            stages: stages.iter().map(|s| s.to_string()).collect(),
            jobs,
            ..Default::default()
        };
        PipelineGraph::from_pipeline(&pipeline, &RunOptions::default()).unwrap()
    }

    fn state_of<'a>(result: &'a PipelineResult, name: &str) -> &'a JobReport {
        result
            .jobs
            .iter()
            .find(|j| j.name == name)
            .unwrap_or_else(|| panic!("no report for job '{}'", name))
    }

    #[tokio::test]
    async fn every_job_terminates_on_success() {
        let graph = graph(
            &["build", "test"],
            vec![job("a", "build"), job("b", "build"), job("c", "test")],
        );
        let result = Scheduler::new(graph, Arc::new(FakeRunner::new())).run().await;

        assert!(result.succeeded());
        assert_eq!(result.exit_code(), 0);
        assert!(result.jobs.iter().all(|j| j.state == JobState::Succeeded));
    }

    #[tokio::test]
    async fn empty_pipeline_succeeds() {
        let graph = graph(&[], Vec::new());
        let result = Scheduler::new(graph, Arc::new(FakeRunner::new())).run().await;

        assert!(result.succeeded());
        assert!(result.jobs.is_empty());
    }

    #[tokio::test]
    async fn failed_prerequisite_skips_dependents_but_not_siblings() {
        let graph = graph(
            &["build", "test"],
            vec![job("a", "build"), job("b", "build"), job("c", "test")],
        );
        let runner = Arc::new(FakeRunner::new().failing("a", 1));
        let result = Scheduler::new(graph, runner).run().await;

        assert!(!result.succeeded());
        assert_eq!(state_of(&result, "a").state, JobState::Failed);
        assert_eq!(state_of(&result, "b").state, JobState::Succeeded);
        let skipped = state_of(&result, "c");
        assert_eq!(skipped.state, JobState::Skipped);
        assert_eq!(skipped.reason.as_deref(), Some("dependency 'a' failed"));
    }

    #[tokio::test]
    async fn skips_propagate_transitively() {
        let mut b = job("b", "build");
        b.needs = Some(vec!["a".to_string()]);
        let mut c = job("c", "build");
        c.needs = Some(vec!["b".to_string()]);
        let graph = graph(&["build"], vec![job("a", "build"), b, c]);

        let runner = Arc::new(FakeRunner::new().failing("a", 1));
        let result = Scheduler::new(graph, runner).run().await;

        assert_eq!(state_of(&result, "b").state, JobState::Skipped);
        let c = state_of(&result, "c");
        assert_eq!(c.state, JobState::Skipped);
        assert_eq!(c.reason.as_deref(), Some("dependency 'b' was skipped"));
    }

    #[tokio::test]
    async fn allowed_failure_unblocks_dependents_and_stays_a_warning() {
        let mut patch = job("check-patch", "build");
        patch.allow_failure = AllowFailure::Flag(true);
        let graph = graph(
            &["build", "test"],
            vec![job("check-dco", "build"), patch, job("minreqs", "test")],
        );

        let runner = Arc::new(FakeRunner::new().failing("check-patch", 1));
        let result = Scheduler::new(graph, runner).run().await;

        assert!(result.succeeded());
        assert_eq!(state_of(&result, "check-dco").state, JobState::Succeeded);
        assert_eq!(state_of(&result, "minreqs").state, JobState::Succeeded);

        let patch = state_of(&result, "check-patch");
        assert_eq!(patch.state, JobState::Failed);
        assert!(patch.failure_allowed);
        let warnings: Vec<_> = result.warnings().map(|j| j.name.as_str()).collect();
        assert_eq!(warnings, vec!["check-patch"]);
    }

    #[tokio::test]
    async fn exit_code_allowance_matches_the_recorded_code() {
        let mut probe = job("probe", "build");
        probe.allow_failure = AllowFailure::ExitCodes {
            exit_codes: vec![3],
        };
        let graph = graph(&["build", "test"], vec![probe, job("after", "test")]);

        let runner = Arc::new(FakeRunner::new().failing("probe", 3));
        let result = Scheduler::new(graph, runner).run().await;

        assert!(result.succeeded());
        assert_eq!(state_of(&result, "after").state, JobState::Succeeded);
        assert!(state_of(&result, "probe").failure_allowed);
    }

    #[tokio::test]
    async fn unlisted_exit_code_is_not_allowed() {
        let mut probe = job("probe", "build");
        probe.allow_failure = AllowFailure::ExitCodes {
            exit_codes: vec![3],
        };
        let graph = graph(&["build", "test"], vec![probe, job("after", "test")]);

        let runner = Arc::new(FakeRunner::new().failing("probe", 4));
        let result = Scheduler::new(graph, runner).run().await;

        assert!(!result.succeeded());
        assert_eq!(state_of(&result, "after").state, JobState::Skipped);
        assert!(!state_of(&result, "probe").failure_allowed);
    }

    #[tokio::test]
    async fn concurrency_bound_is_respected() {
        let jobs = (0..4).map(|i| job(&format!("j{}", i), "build")).collect();
        let graph = graph(&["build"], jobs);

        let mut runner = FakeRunner::new();
        for i in 0..4 {
            runner = runner.delayed(&format!("j{}", i), 20);
        }
        let runner = Arc::new(runner);

        let result = Scheduler::new(graph, Arc::clone(&runner))
            .with_config(SchedulerConfig {
                max_parallel: 2,
                ..SchedulerConfig::default()
            })
            .run()
            .await;

        assert!(result.succeeded());
        assert!(runner.max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    async fn run_unrelated_pair(slow_first: bool) -> PipelineResult {
        let graph = graph(
            &["build", "test"],
            vec![job("a", "build"), job("b", "build"), job("c", "test")],
        );

        let (slow, fast) = if slow_first { ("a", "b") } else { ("b", "a") };
        let runner = Arc::new(
            FakeRunner::new()
                .delayed(slow, 30)
                .delayed(fast, 5)
                .failing("b", 1),
        );
        Scheduler::new(graph, runner).run().await
    }

    #[tokio::test]
    async fn outcome_is_independent_of_interleaving() {
        let first = run_unrelated_pair(true).await;
        let second = run_unrelated_pair(false).await;

        for name in ["a", "b", "c"] {
            assert_eq!(
                state_of(&first, name).state,
                state_of(&second, name).state,
                "job '{}' diverged between interleavings",
                name
            );
        }
        assert_eq!(first.succeeded(), second.succeeded());
        assert_eq!(state_of(&first, "c").state, JobState::Skipped);
    }

    #[tokio::test]
    async fn cancellation_skips_pending_and_force_fails_running() {
        let graph = graph(
            &["build", "test"],
            vec![job("stuck", "build"), job("later", "test")],
        );
        let runner = Arc::new(FakeRunner::new().hanging("stuck"));

        let scheduler = Scheduler::new(graph, Arc::clone(&runner)).with_config(SchedulerConfig {
            max_parallel: 0,
            cancel_grace: Duration::from_millis(50),
        });
        let handle = scheduler.cancel_handle();

        let task = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let result = task.await.unwrap();

        assert!(!result.succeeded());

        let stuck = state_of(&result, "stuck");
        assert_eq!(stuck.state, JobState::Failed);
        assert_eq!(stuck.reason.as_deref(), Some("cancelled"));

        let later = state_of(&result, "later");
        assert_eq!(later.state, JobState::Skipped);
        assert_eq!(later.reason.as_deref(), Some("cancelled"));

        assert_eq!(runner.cancelled.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn adapter_errors_are_recorded_as_failures() {
        struct BrokenRunner;

        #[async_trait::async_trait]
        impl JobRunner for BrokenRunner {
            async fn run(&self, _request: RunRequest) -> Result<JobOutcome, RunnerError> {
                Err(RunnerError::Launch("no such image".to_string()))
            }

            async fn cancel(&self, _run_id: RunId) {}
        }

        let graph = graph(&["build"], vec![job("a", "build")]);
        let result = Scheduler::new(graph, Arc::new(BrokenRunner)).run().await;

        assert!(!result.succeeded());
        let a = state_of(&result, "a");
        assert_eq!(a.state, JobState::Failed);
        assert!(a.reason.as_deref().unwrap_or("").contains("no such image"));
    }
}
