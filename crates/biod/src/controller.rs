//! Run controller: composes the store, directory layout, and executor into
//! the create / start / rerun lifecycle.
//!
//! Creating a run touches both the database and the filesystem. The two are
//! not transactional, so a failure after the row exists is compensated: the
//! run directory is removed and the pending row discarded before the error
//! is returned. Startup recovery repairs whatever a crash left between the
//! two: interrupted runs, pending rows whose creation never finished, and
//! directories or rows missing their counterpart.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bio_core::manifest::ManifestError;
use bio_core::{Id, Run, RunFailure, RunManifest, RunStatus, Workflow};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::executor::{Executor, ExecutorConfig, ExecutorError, RunOutcome};
use crate::layout::{self, LayoutError, RunLayout};
use crate::status::{StatusError, StatusManager};
use crate::storage::{Storage, StorageError};

/// Reason recorded on runs found `running` at daemon start.
pub const INTERRUPTED_REASON: &str = "interrupted";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("run {run_id} is {status}, only pending runs can be started")]
    NotPending { run_id: String, status: RunStatus },
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error(transparent)]
    Status(StatusError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Executor(ExecutorError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

impl From<StorageError> for ControllerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::RunNotFound(id) => Self::RunNotFound(id),
            other => Self::Storage(other),
        }
    }
}

impl From<StatusError> for ControllerError {
    fn from(e: StatusError) -> Self {
        match e {
            StatusError::RunNotFound(id) => Self::RunNotFound(id),
            other => Self::Status(other),
        }
    }
}

impl From<ExecutorError> for ControllerError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Status(status) => status.into(),
            other => Self::Executor(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// A newly created run plus the inputs that could not be copied.
#[derive(Debug, Clone)]
pub struct CreatedRun {
    pub run: Run,
    pub skipped_inputs: Vec<String>,
}

/// What startup recovery found.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Runs found `running`, now `failed` with reason `interrupted`.
    pub interrupted: Vec<Id>,
    /// Pending runs whose creation never finished; row and directory removed.
    pub discarded: Vec<Id>,
    /// Directories under `runs/` with no row. Left on disk.
    pub orphan_dirs: Vec<Id>,
    /// Rows with no run directory, including the discarded pending ones.
    pub orphan_rows: Vec<Id>,
}

/// Runs created for a workflow, one per step in step order.
#[derive(Debug, Clone)]
pub struct WorkflowExecution {
    pub runs: Vec<Run>,
    /// True when every step's run completed.
    pub completed: bool,
    pub skipped_inputs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Controller {
    storage: Arc<Storage>,
    status: StatusManager,
    executor: Executor,
    base_path: PathBuf,
    default_tool: String,
}

impl Controller {
    pub fn new(
        storage: Arc<Storage>,
        base_path: PathBuf,
        default_tool: impl Into<String>,
        executor_config: ExecutorConfig,
    ) -> Self {
        let status = StatusManager::new(Arc::clone(&storage));
        let executor = Executor::new(status.clone(), executor_config);
        Self {
            storage,
            status,
            executor,
            base_path,
            default_tool: default_tool.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn status_manager(&self) -> &StatusManager {
        &self.status
    }

    pub fn layout(&self, run_id: &Id) -> RunLayout {
        RunLayout::new(&self.base_path, run_id)
    }

    /// Create a run: insert the row, build its directories, copy the inputs.
    pub async fn create_run(
        &self,
        input_files: Vec<String>,
        tool: Option<String>,
    ) -> Result<CreatedRun> {
        if input_files.is_empty() {
            return Err(ControllerError::InvalidRequest(
                "at least one input file is required".to_string(),
            ));
        }
        // Relative paths would resolve against the daemon's working directory.
        if let Some(relative) = input_files.iter().find(|p| !Path::new(p).is_absolute()) {
            return Err(ControllerError::InvalidRequest(format!(
                "input path must be absolute: {relative}"
            )));
        }
        let tool = match tool {
            Some(t) if t.trim().is_empty() => {
                return Err(ControllerError::InvalidRequest(
                    "tool must not be empty".to_string(),
                ))
            }
            Some(t) => t,
            None => self.default_tool.clone(),
        };

        let mut run = self.storage.create_run(&input_files, "", &tool).await?;

        match self.prepare_run(&run).await {
            Ok((output_path, skipped_inputs)) => {
                run.output_path = output_path;
                info!(
                    run_id = %run.id,
                    tool = %run.tool,
                    inputs = run.input_files.len(),
                    skipped = skipped_inputs.len(),
                    "run created"
                );
                Ok(CreatedRun {
                    run,
                    skipped_inputs,
                })
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "run setup failed; rolling back");
                self.rollback_create(&run.id).await;
                Err(err)
            }
        }
    }

    async fn prepare_run(&self, run: &Run) -> Result<(String, Vec<String>)> {
        layout::setup_run_directory(&self.base_path, &run.id)?;
        let layout = self.layout(&run.id);
        let output_path = layout.output_dir().display().to_string();
        self.storage.set_output_path(&run.id, &output_path).await?;

        let report = layout::move_input_files(&run.input_files, &layout.input_dir())?;
        let skipped = report
            .skipped
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        Ok((output_path, skipped))
    }

    async fn rollback_create(&self, run_id: &Id) {
        if let Err(e) = layout::remove_run_directory(&self.base_path, run_id) {
            error!(run_id = %run_id, error = %e, "failed to remove run directory during rollback");
        }
        match self.storage.discard_pending_run(run_id).await {
            Ok(true) => {}
            Ok(false) => warn!(run_id = %run_id, "run row already gone or no longer pending"),
            Err(e) => error!(run_id = %run_id, error = %e, "failed to discard run row"),
        }
    }

    pub async fn get_run(&self, run_id: &Id) -> Result<Run> {
        Ok(self.storage.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<Run>> {
        let runs = match status {
            Some(status) => self.storage.list_runs_with_status(status).await?,
            None => self.storage.list_runs().await?,
        };
        Ok(runs)
    }

    /// Look up a run and check that it can still be started.
    pub async fn ensure_pending(&self, run_id: &Id) -> Result<Run> {
        let run = self.storage.get_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(ControllerError::NotPending {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        Ok(run)
    }

    /// Execute a pending run to completion and write its manifest.
    pub async fn start_run(&self, run_id: &Id) -> Result<RunOutcome> {
        let run = self.ensure_pending(run_id).await?;
        let layout = self.layout(run_id);

        let result = self
            .executor
            .execute_run(
                run_id,
                &run.tool,
                &run.input_files,
                &layout.output_dir(),
                &layout.log_dir(),
            )
            .await;

        // A lost start race leaves the run untouched; only finished runs get a manifest.
        let lost_race = matches!(
            result,
            Err(ExecutorError::Status(StatusError::InvalidTransition { .. }))
        );
        if !lost_race {
            self.write_manifest(run_id, &layout).await;
        }

        Ok(result?)
    }

    /// Create a new pending run with the same inputs and tool as `run_id`.
    pub async fn rerun(&self, run_id: &Id) -> Result<CreatedRun> {
        let source = self.storage.get_run(run_id).await?;
        let created = self
            .create_run(source.input_files, Some(source.tool))
            .await?;
        info!(run_id = %created.run.id, source_run_id = %run_id, "rerun created");
        Ok(created)
    }

    /// Execute a planned workflow over `input_files`.
    ///
    /// Each step becomes its own run using the step's tool. Steps run in
    /// order and the first failed run stops the workflow; later steps get no
    /// run. Step params are not passed to the tool.
    pub async fn execute_workflow(
        &self,
        workflow: &Workflow,
        input_files: Vec<String>,
    ) -> Result<WorkflowExecution> {
        if workflow.steps.is_empty() {
            return Err(ControllerError::InvalidRequest(
                "workflow has no steps".to_string(),
            ));
        }

        let mut execution = WorkflowExecution {
            runs: Vec::with_capacity(workflow.steps.len()),
            completed: false,
            skipped_inputs: Vec::new(),
        };
        for (idx, step) in workflow.steps.iter().enumerate() {
            let created = self
                .create_run(input_files.clone(), Some(step.tool.clone()))
                .await?;
            if idx == 0 {
                execution.skipped_inputs = created.skipped_inputs;
            }
            let run_id = created.run.id;
            info!(run_id = %run_id, step = idx + 1, tool = %step.tool, "workflow step started");

            let result = self.start_run(&run_id).await;
            execution.runs.push(self.storage.get_run(&run_id).await?);
            match result {
                Ok(_) => {}
                Err(ControllerError::Executor(err)) => {
                    warn!(
                        run_id = %run_id,
                        step = idx + 1,
                        error = %err,
                        "workflow step failed; stopping"
                    );
                    return Ok(execution);
                }
                Err(err) => return Err(err),
            }
        }

        execution.completed = true;
        Ok(execution)
    }

    /// Repair what a previous process left behind. Must run before requests
    /// are served.
    ///
    /// - Runs left `running` are failed with reason `interrupted`.
    /// - Pending rows with no directory or no output path never finished
    ///   creation and are rolled back.
    /// - Directories without a row and finished rows without a directory are
    ///   reported but left alone.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let failure = RunFailure {
            failed_step: None,
            reason: INTERRUPTED_REASON.to_string(),
        };
        for run in self.storage.list_runs_with_status(RunStatus::Running).await? {
            match self.status.fail(&run.id, &failure).await {
                Ok(()) => {
                    warn!(run_id = %run.id, "marked interrupted run as failed");
                    self.write_manifest(&run.id, &self.layout(&run.id)).await;
                    report.interrupted.push(run.id);
                }
                // Finished between the listing and the update.
                Err(StatusError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut known = HashSet::new();
        for run in self.storage.list_runs().await? {
            let has_dir = self.layout(&run.id).run_dir().is_dir();
            if !has_dir {
                warn!(run_id = %run.id, status = %run.status, "run has no run directory");
                report.orphan_rows.push(run.id.clone());
            }
            if run.status == RunStatus::Pending && (!has_dir || run.output_path.is_empty()) {
                warn!(run_id = %run.id, "discarding run whose creation never finished");
                self.rollback_create(&run.id).await;
                report.discarded.push(run.id);
                continue;
            }
            known.insert(run.id.0);
        }

        for id in layout::list_run_directories(&self.base_path)? {
            if !known.contains(id.as_ref()) {
                warn!(
                    run_id = %id,
                    base_path = %self.base_path.display(),
                    "run directory has no matching run"
                );
                report.orphan_dirs.push(id);
            }
        }

        Ok(report)
    }

    async fn write_manifest(&self, run_id: &Id, layout: &RunLayout) {
        let result = async {
            let run = self.storage.get_run(run_id).await?;
            let manifest = RunManifest::for_run(&run, &layout.input_dir())?;
            manifest.write(&layout.manifest_path())?;
            Ok::<_, ControllerError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(run_id = %run_id, error = %e, "failed to write run manifest");
        }
    }
}
