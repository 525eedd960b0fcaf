//! Status manager: validated run status transitions.
//!
//! Only edges of the run state machine are accepted:
//!
//! ```text
//! pending --> running --> completed
//!                    \--> failed
//! ```
//!
//! The check and the write are a single compare-and-set statement, so two
//! callers racing to start the same run cannot both succeed.

use std::sync::Arc;

use bio_core::{Id, InvalidStatus, RunFailure, RunStatus};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    InvalidStatus(#[from] InvalidStatus),
    #[error("invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for StatusError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::RunNotFound(id) => Self::RunNotFound(id),
            other => Self::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StatusError>;

/// Applies status transitions to the run store.
#[derive(Debug, Clone)]
pub struct StatusManager {
    storage: Arc<Storage>,
}

impl StatusManager {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Transition using an untyped status value (API and CLI boundary).
    ///
    /// Unknown values fail with `InvalidStatus` before the store is touched.
    pub async fn transition(&self, run_id: &Id, new_status: &str) -> Result<RunStatus> {
        let status: RunStatus = new_status.parse()?;
        self.transition_to(run_id, status).await?;
        Ok(status)
    }

    /// Transition to a typed status.
    pub async fn transition_to(&self, run_id: &Id, to: RunStatus) -> Result<()> {
        self.apply(run_id, to, None).await
    }

    /// Mark a running run as failed, recording which step failed and why.
    pub async fn fail(&self, run_id: &Id, failure: &RunFailure) -> Result<()> {
        self.apply(run_id, RunStatus::Failed, Some(failure)).await
    }

    async fn apply(&self, run_id: &Id, to: RunStatus, failure: Option<&RunFailure>) -> Result<()> {
        let from = RunStatus::predecessors(to);
        let changed = self
            .storage
            .compare_and_set_status(run_id, &from, to, failure)
            .await?;

        if changed {
            info!(run_id = %run_id, status = %to, "run status updated");
            return Ok(());
        }

        // Nothing matched: either the run is missing or its status has no edge to `to`.
        let current = self.storage.get_run(run_id).await?;
        debug!(
            run_id = %run_id,
            from = %current.status,
            to = %to,
            "rejected status transition"
        );
        Err(StatusError::InvalidTransition {
            run_id: run_id.to_string(),
            from: current.status,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (StatusManager, Arc<Storage>, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        (StatusManager::new(Arc::clone(&storage)), storage, dir)
    }

    async fn status_of(storage: &Storage, id: &Id) -> RunStatus {
        storage.get_run(id).await.unwrap().status
    }

    #[tokio::test]
    async fn happy_path_to_completed() {
        let (manager, storage, _dir) = setup().await;
        let run = storage.create_run(&[], "", "fastqc").await.unwrap();

        manager.transition(&run.id, "running").await.unwrap();
        assert_eq!(status_of(&storage, &run.id).await, RunStatus::Running);

        let status = manager.transition(&run.id, "completed").await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(status_of(&storage, &run.id).await, RunStatus::Completed);
    }

    #[tokio::test]
    async fn bogus_status_is_rejected_and_row_unchanged() {
        let (manager, storage, _dir) = setup().await;
        let run = storage.create_run(&[], "", "fastqc").await.unwrap();

        let err = manager.transition(&run.id, "bogus").await.unwrap_err();
        assert!(matches!(err, StatusError::InvalidStatus(_)));
        assert_eq!(status_of(&storage, &run.id).await, RunStatus::Pending);
    }

    #[tokio::test]
    async fn bogus_status_wins_over_missing_run() {
        let (manager, _storage, _dir) = setup().await;
        let err = manager
            .transition(&Id::from_string("missing"), "bogus")
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::InvalidStatus(_)));
    }

    #[tokio::test]
    async fn terminal_states_reject_further_transitions() {
        let (manager, storage, _dir) = setup().await;
        let run = storage.create_run(&[], "", "fastqc").await.unwrap();
        manager.transition_to(&run.id, RunStatus::Running).await.unwrap();
        manager.transition_to(&run.id, RunStatus::Completed).await.unwrap();

        for next in RunStatus::ALL {
            let err = manager.transition_to(&run.id, next).await.unwrap_err();
            match err {
                StatusError::InvalidTransition { from, to, .. } => {
                    assert_eq!(from, RunStatus::Completed);
                    assert_eq!(to, next);
                }
                e => panic!("expected InvalidTransition, got {e:?}"),
            }
        }
        assert_eq!(status_of(&storage, &run.id).await, RunStatus::Completed);
    }

    #[tokio::test]
    async fn pending_cannot_skip_to_completed() {
        let (manager, storage, _dir) = setup().await;
        let run = storage.create_run(&[], "", "fastqc").await.unwrap();

        let err = manager
            .transition_to(&run.id, RunStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::InvalidTransition { .. }));
        assert_eq!(status_of(&storage, &run.id).await, RunStatus::Pending);
    }

    #[tokio::test]
    async fn second_start_loses_the_race() {
        let (manager, storage, _dir) = setup().await;
        let run = storage.create_run(&[], "", "fastqc").await.unwrap();

        manager.transition_to(&run.id, RunStatus::Running).await.unwrap();
        let err = manager
            .transition_to(&run.id, RunStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StatusError::InvalidTransition {
                from: RunStatus::Running,
                to: RunStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let (manager, _storage, _dir) = setup().await;
        let err = manager
            .transition_to(&Id::from_string("missing"), RunStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn fail_records_step_and_reason() {
        let (manager, storage, _dir) = setup().await;
        let run = storage.create_run(&[], "", "fastqc").await.unwrap();
        manager.transition_to(&run.id, RunStatus::Running).await.unwrap();

        let failure = RunFailure {
            failed_step: Some("/data/b.fastq".to_string()),
            reason: "timed out after 5s".to_string(),
        };
        manager.fail(&run.id, &failure).await.unwrap();

        let failed = storage.get_run(&run.id).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.failed_step.as_deref(), Some("/data/b.fastq"));
        assert_eq!(failed.error.as_deref(), Some("timed out after 5s"));
    }
}
