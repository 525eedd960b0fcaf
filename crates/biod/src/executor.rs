//! Run executor: invokes the run's tool once per input file.
//!
//! Steps run strictly in input order on the calling task. Each step is
//! `<tool> <input> -o <output_dir>`, spawned from an argument vector (never
//! through a shell) with stdout and stderr redirected into the run's single
//! `execution.log`. The first failing step aborts the remaining ones and the
//! run is marked `failed` with that step recorded.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use bio_core::{Id, RunFailure, RunStatus};
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::layout::EXECUTION_LOG;
use crate::status::{StatusError, StatusManager};

/// Interval between heartbeat log messages while a step is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Why a single step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    NonZeroExit(i32),
    /// Terminated by a signal (no exit code).
    Signaled,
    LaunchFailed(String),
    Timeout(u32),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonZeroExit(code) => write!(f, "exited with code {code}"),
            Self::Signaled => write!(f, "terminated by signal"),
            Self::LaunchFailed(reason) => write!(f, "failed to launch: {reason}"),
            Self::Timeout(secs) => write!(f, "timed out after {secs}s"),
        }
    }
}

/// A failed external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{tool} {}: {kind}", args.join(" "))]
pub struct ToolFailure {
    pub tool: String,
    pub args: Vec<String>,
    /// Input file of the failing step.
    pub input: String,
    pub kind: FailureKind,
}

impl ToolFailure {
    pub fn exit_code(&self) -> Option<i32> {
        match self.kind {
            FailureKind::NonZeroExit(code) => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("external tool failed: {0}")]
    ExternalTool(ToolFailure),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Executor configuration.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Timeout per step in seconds (0 = no timeout).
    pub step_timeout_sec: u32,
}

impl ExecutorConfig {
    pub fn from_config(config: &bio_core::Config) -> Self {
        Self {
            step_timeout_sec: config.step_timeout_sec,
        }
    }
}

/// Result of a run whose steps all succeeded.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub steps_completed: usize,
    pub log_path: PathBuf,
    pub duration_ms: u64,
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(ExitStatus),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Executor {
    status: StatusManager,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(status: StatusManager, config: ExecutorConfig) -> Self {
        Self { status, config }
    }

    /// Execute every step of a `pending` run and drive it to a terminal status.
    pub async fn execute_run(
        &self,
        run_id: &Id,
        tool: &str,
        input_files: &[String],
        output_dir: &Path,
        log_dir: &Path,
    ) -> Result<RunOutcome> {
        self.status.transition_to(run_id, RunStatus::Running).await?;

        let started = Instant::now();
        let log_path = log_dir.join(EXECUTION_LOG);
        info!(
            run_id = %run_id,
            tool = tool,
            steps = input_files.len(),
            log = %log_path.display(),
            "run started"
        );

        // The log handle lives until this function returns, on every path.
        let mut log = match open_log(&log_path, output_dir) {
            Ok(file) => file,
            Err(e) => {
                let err = ExecutorError::Io {
                    path: log_path.clone(),
                    source: e,
                };
                self.mark_failed(run_id, None, &err).await;
                return Err(err);
            }
        };

        for (idx, input) in input_files.iter().enumerate() {
            if let Err(err) = self
                .run_step(run_id, &mut log, &log_path, tool, input, output_dir)
                .await
            {
                let _ = writeln!(log, "==> step {} failed: {err}", idx + 1);
                self.mark_failed(run_id, Some(input), &err).await;
                return Err(err);
            }
        }

        let _ = writeln!(log, "==> run completed ({} steps)", input_files.len());
        self.mark_completed(run_id).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(run_id = %run_id, duration_ms, "run completed");
        Ok(RunOutcome {
            status: RunStatus::Completed,
            steps_completed: input_files.len(),
            log_path,
            duration_ms,
        })
    }

    /// Run one step, appending its output to `log`.
    async fn run_step(
        &self,
        run_id: &Id,
        log: &mut File,
        log_path: &Path,
        tool: &str,
        input: &str,
        output_dir: &Path,
    ) -> Result<()> {
        // The output path goes to the tool as-is; `display_args` is for logs and errors.
        let args = [OsStr::new(input), OsStr::new("-o"), output_dir.as_os_str()];
        let display_args: Vec<String> = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let failure = |kind: FailureKind| {
            ExecutorError::ExternalTool(ToolFailure {
                tool: tool.to_string(),
                args: display_args.clone(),
                input: input.to_string(),
                kind,
            })
        };
        let log_io = |source: io::Error| ExecutorError::Io {
            path: log_path.to_path_buf(),
            source,
        };

        writeln!(log, "==> {tool} {}", display_args.join(" ")).map_err(log_io)?;
        log.flush().map_err(log_io)?;

        let stdout = log.try_clone().map_err(log_io)?;
        let stderr = log.try_clone().map_err(log_io)?;

        let mut cmd = Command::new(tool);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        info!(run_id = %run_id, tool = tool, input = input, "step started");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Err(failure(FailureKind::LaunchFailed(e.to_string()))),
        };

        let started = Instant::now();
        let timeout_sec = self.config.step_timeout_sec;
        let timeout_duration = Duration::from_secs(u64::from(timeout_sec));

        let outcome = loop {
            let elapsed = started.elapsed();

            if timeout_sec > 0 && elapsed >= timeout_duration {
                warn!(run_id = %run_id, input = input, timeout_sec, "step timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(run_id = %run_id, error = %err, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut;
            }

            let remaining_timeout = if timeout_sec > 0 {
                timeout_duration.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };
            let sleep_duration = HEARTBEAT_INTERVAL.min(remaining_timeout);

            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => break ProcessOutcome::Completed(status),
                        Err(e) => return Err(failure(FailureKind::LaunchFailed(e.to_string()))),
                    }
                }
                () = tokio::time::sleep(sleep_duration) => {
                    info!(
                        run_id = %run_id,
                        input = input,
                        elapsed_sec = started.elapsed().as_secs(),
                        "{tool} still running"
                    );
                }
            }
        };

        match outcome {
            ProcessOutcome::TimedOut => Err(failure(FailureKind::Timeout(timeout_sec))),
            ProcessOutcome::Completed(status) if status.success() => {
                info!(
                    run_id = %run_id,
                    input = input,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "step succeeded"
                );
                Ok(())
            }
            ProcessOutcome::Completed(status) => Err(failure(match status.code() {
                Some(code) => FailureKind::NonZeroExit(code),
                None => FailureKind::Signaled,
            })),
        }
    }

    /// Record completion, retrying once if the store itself failed.
    ///
    /// Every step has already succeeded here. If both writes fail the run stays
    /// `running` until startup recovery marks it interrupted.
    async fn mark_completed(&self, run_id: &Id) -> Result<()> {
        match self.status.transition_to(run_id, RunStatus::Completed).await {
            Ok(()) => return Ok(()),
            Err(StatusError::Storage(err)) => {
                warn!(run_id = %run_id, error = %err, "failed to record completion; retrying");
            }
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.status.transition_to(run_id, RunStatus::Completed).await {
            error!(
                run_id = %run_id,
                error = %err,
                "completion not recorded; run stays running until recovery"
            );
            return Err(err.into());
        }
        Ok(())
    }

    /// Record a failure on the run. A store error here is logged, not returned,
    /// so the caller still sees the original cause.
    async fn mark_failed(&self, run_id: &Id, input: Option<&str>, err: &ExecutorError) {
        warn!(run_id = %run_id, error = %err, "run failed");
        let failure = RunFailure {
            failed_step: input.map(str::to_string),
            reason: err.to_string(),
        };
        if let Err(status_err) = self.status.fail(run_id, &failure).await {
            error!(run_id = %run_id, error = %status_err, "failed to record run failure");
        }
    }
}

/// Create the output directory and create/truncate the execution log.
fn open_log(log_path: &Path, output_dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(output_dir)?;
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    File::create(log_path)
}
