// Shell Runner
// Executes job scripts through the local shell

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::parser::models::Job;
use crate::runners::{JobOutcome, JobRunner, RunId, RunRequest, RunnerError};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};

/// Get the shell executable and arguments
fn shell_command() -> (&'static str, &'static [&'static str]) {
    if cfg!(target_os = "windows") {
        ("cmd", &["/C"])
    } else {
        ("sh", &["-e", "-c"])
    }
}

fn join_script(script: &[String]) -> String {
    if cfg!(target_os = "windows") {
        script.join(" && ")
    } else {
        script.join("\n")
    }
}

/// Runs jobs as local shell processes. Job images are advisory here; the
/// script runs directly on the host.
pub struct ShellRunner {
    working_dir: PathBuf,
    /// Per-job wall clock limit (None = no limit)
    timeout: Option<Duration>,
    event_tx: Option<ProgressSender>,
    active: Mutex<HashMap<RunId, Arc<Notify>>>,
}

impl ShellRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: None,
            event_tx: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    async fn run_inner(
        &self,
        request: &RunRequest,
        cancelled: Arc<Notify>,
    ) -> Result<JobOutcome, RunnerError> {
        let (shell_cmd, shell_args) = shell_command();
        let script = join_script(&request.job.script);

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(script);
        cmd.current_dir(&self.working_dir);
        cmd.envs(&request.env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Launch(format!("'{}': {}", shell_cmd, e)))?;

        let job_name = request.job.name.clone();
        let stdout_handle = child.stdout.take().map(|stdout| {
            let tx = self.event_tx.clone();
            let name = job_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tx.send_event(ExecutionEvent::job_output(&name, line, false));
                }
            })
        });
        let stderr_handle = child.stderr.take().map(|stderr| {
            let tx = self.event_tx.clone();
            let name = job_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tx.send_event(ExecutionEvent::job_output(&name, line, true));
                }
            })
        });

        // Sleeps past tokio's horizon are capped, so Duration::MAX works
        // as "never" here.
        let limit = self.timeout.unwrap_or(Duration::MAX);
        let status = tokio::select! {
            result = child.wait() => Some(result?),
            _ = cancelled.notified() => {
                let _ = child.kill().await;
                child.wait().await.ok()
            }
            _ = tokio::time::sleep(limit) => {
                let _ = child.kill().await;
                return Err(RunnerError::Timeout(limit.as_secs()));
            }
        };

        if let Some(handle) = stdout_handle {
            let _ = handle.await;
        }
        if let Some(handle) = stderr_handle {
            let _ = handle.await;
        }

        let exit_code = status.and_then(|s| s.code());
        let artifacts = self.collect_artifacts(&request.job, exit_code == Some(0));

        Ok(JobOutcome {
            exit_code,
            artifacts,
        })
    }

    /// Resolve declared artifact paths against the working directory,
    /// keeping only the ones that exist and match the job's `when` policy.
    fn collect_artifacts(&self, job: &Job, success: bool) -> Vec<PathBuf> {
        let Some(policy) = &job.artifacts else {
            return Vec::new();
        };
        if !policy.when.applies(success) {
            return Vec::new();
        }
        policy
            .paths
            .iter()
            .map(|p| self.working_dir.join(p))
            .filter(|p| p.exists())
            .collect()
    }
}

#[async_trait]
impl JobRunner for ShellRunner {
    async fn run(&self, request: RunRequest) -> Result<JobOutcome, RunnerError> {
        let cancelled = Arc::new(Notify::new());
        self.active
            .lock()
            .await
            .insert(request.run_id, Arc::clone(&cancelled));

        let outcome = self.run_inner(&request, cancelled).await;
        self.active.lock().await.remove(&request.run_id);
        outcome
    }

    async fn cancel(&self, run_id: RunId) {
        if let Some(notify) = self.active.lock().await.get(&run_id) {
            notify.notify_one();
        }
    }
}
