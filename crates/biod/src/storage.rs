//! SQLite run store.
//!
//! The single source of truth for run state. Every mutation is one SQL
//! statement so concurrent writers cannot lose updates; status changes go
//! through [`Storage::compare_and_set_status`], which only matches rows whose
//! current status is an allowed predecessor.

use bio_core::{Id, Run, RunFailure, RunStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for runs table queries.
/// Using explicit columns instead of SELECT * keeps the row mapping stable
/// if later migrations append columns.
const RUNS_COLUMNS: &str =
    "run_id, timestamp, input_files, output_path, status, tool, updated_at, failed_step, error";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt run row {run_id}: {reason}")]
    Decode { run_id: String, reason: String },
    #[error("run not found: {0}")]
    RunNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for runs.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Storage {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    /// Apply the embedded schema. Safe to call on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            // Remove comment lines before splitting.
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Insert a new `pending` run with a fresh id.
    pub async fn create_run(
        &self,
        input_files: &[String],
        output_path: &str,
        tool: &str,
    ) -> Result<Run> {
        let now = Utc::now();
        let run = Run {
            id: Id::new(),
            timestamp: now,
            input_files: input_files.to_vec(),
            output_path: output_path.to_string(),
            status: RunStatus::Pending,
            tool: tool.to_string(),
            updated_at: now,
            failed_step: None,
            error: None,
        };
        let input_json = serde_json::to_string(&run.input_files)?;
        let ts = format_ts(now);

        sqlx::query(
            r#"
            INSERT INTO runs (run_id, timestamp, input_files, output_path, status, tool, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(&ts)
        .bind(&input_json)
        .bind(&run.output_path)
        .bind(run.status.as_str())
        .bind(&run.tool)
        .bind(&ts)
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE run_id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;

        row.into_run()
    }

    /// List all runs, newest first.
    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs ORDER BY timestamp DESC, rowid DESC");
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// List runs currently in `status`, newest first.
    pub async fn list_runs_with_status(&self, status: RunStatus) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM runs WHERE status = ?1 ORDER BY timestamp DESC, rowid DESC"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Set the output path of a run.
    pub async fn set_output_path(&self, id: &Id, output_path: &str) -> Result<()> {
        let now = format_ts(Utc::now());
        let result =
            sqlx::query("UPDATE runs SET output_path = ?1, updated_at = ?2 WHERE run_id = ?3")
                .bind(output_path)
                .bind(&now)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Atomically move a run to `to` if its current status is one of `from`.
    ///
    /// Returns `false` when no row matched (missing run or disallowed current
    /// status); the caller decides which by reading the row afterwards.
    /// Failure details are written with the status and cleared otherwise.
    pub async fn compare_and_set_status(
        &self,
        id: &Id,
        from: &[RunStatus],
        to: RunStatus,
        failure: Option<&RunFailure>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let placeholders = (0..from.len())
            .map(|i| format!("?{}", i + 6))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE runs SET status = ?1, updated_at = ?2, failed_step = ?3, error = ?4 \
             WHERE run_id = ?5 AND status IN ({placeholders})"
        );

        let now = format_ts(Utc::now());
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(&now)
            .bind(failure.and_then(|f| f.failed_step.as_deref()))
            .bind(failure.map(|f| f.reason.as_str()))
            .bind(id.as_ref());
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete a run that never left `pending`.
    ///
    /// Only used to roll back a run whose directory setup failed.
    pub async fn discard_pending_run(&self, id: &Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM runs WHERE run_id = ?1 AND status = 'pending'")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    timestamp: String,
    input_files: String,
    output_path: String,
    status: String,
    tool: String,
    updated_at: String,
    failed_step: Option<String>,
    error: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let decode_err = |reason: String| StorageError::Decode {
            run_id: self.run_id.clone(),
            reason,
        };

        let status = self
            .status
            .parse::<RunStatus>()
            .map_err(|e| decode_err(e.to_string()))?;
        let input_files: Vec<String> = serde_json::from_str(&self.input_files)
            .map_err(|e| decode_err(format!("input_files: {e}")))?;
        let timestamp =
            parse_ts(&self.timestamp).map_err(|e| decode_err(format!("timestamp: {e}")))?;
        let updated_at =
            parse_ts(&self.updated_at).map_err(|e| decode_err(format!("updated_at: {e}")))?;

        Ok(Run {
            id: Id::from_string(self.run_id),
            timestamp,
            input_files,
            output_path: self.output_path,
            status,
            tool: self.tool,
            updated_at,
            failed_step: self.failed_step,
            error: self.error,
        })
    }
}

fn parse_ts(value: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn inputs(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn create_and_get_run() {
        let ts = create_test_storage().await;
        let files = inputs(&["/data/b.fastq", "/data/a.fastq"]);

        let run = ts.storage.create_run(&files, "", "fastqc").await.unwrap();
        let retrieved = ts.storage.get_run(&run.id).await.unwrap();

        assert_eq!(retrieved.id, run.id);
        assert_eq!(retrieved.status, RunStatus::Pending);
        assert_eq!(retrieved.input_files, files);
        assert_eq!(retrieved.output_path, "");
        assert_eq!(retrieved.tool, "fastqc");
        assert!(retrieved.failed_step.is_none());
        assert_eq!(
            retrieved.timestamp.timestamp_micros(),
            run.timestamp.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn create_issues_unique_ids() {
        let ts = create_test_storage().await;
        let files = inputs(&["/data/a.fastq"]);

        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let run = ts.storage.create_run(&files, "", "fastqc").await.unwrap();
            assert!(ids.insert(run.id));
        }
        assert_eq!(ts.storage.list_runs().await.unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn get_run_not_found() {
        let ts = create_test_storage().await;
        let result = ts.storage.get_run(&Id::from_string("missing")).await;
        assert!(matches!(result, Err(StorageError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn list_runs_returns_all() {
        let ts = create_test_storage().await;
        let first = ts.storage.create_run(&[], "", "fastqc").await.unwrap();
        let second = ts.storage.create_run(&[], "", "bwa").await.unwrap();

        let runs = ts.storage.list_runs().await.unwrap();
        let ids: HashSet<_> = runs.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, HashSet::from([first.id, second.id]));
    }

    #[tokio::test]
    async fn set_output_path_updates_row() {
        let ts = create_test_storage().await;
        let run = ts.storage.create_run(&[], "", "fastqc").await.unwrap();

        ts.storage
            .set_output_path(&run.id, "/base/runs/x/output")
            .await
            .unwrap();

        let updated = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(updated.output_path, "/base/runs/x/output");
        assert_eq!(updated.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn set_output_path_not_found() {
        let ts = create_test_storage().await;
        let result = ts
            .storage
            .set_output_path(&Id::from_string("missing"), "/x")
            .await;
        assert!(matches!(result, Err(StorageError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn compare_and_set_respects_current_status() {
        let ts = create_test_storage().await;
        let run = ts.storage.create_run(&[], "", "fastqc").await.unwrap();

        // Wrong predecessor: no change.
        let changed = ts
            .storage
            .compare_and_set_status(&run.id, &[RunStatus::Running], RunStatus::Completed, None)
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(
            ts.storage.get_run(&run.id).await.unwrap().status,
            RunStatus::Pending
        );

        let changed = ts
            .storage
            .compare_and_set_status(&run.id, &[RunStatus::Pending], RunStatus::Running, None)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(
            ts.storage.get_run(&run.id).await.unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn compare_and_set_records_failure() {
        let ts = create_test_storage().await;
        let run = ts.storage.create_run(&[], "", "fastqc").await.unwrap();
        ts.storage
            .compare_and_set_status(&run.id, &[RunStatus::Pending], RunStatus::Running, None)
            .await
            .unwrap();

        let failure = RunFailure {
            failed_step: Some("/data/a.fastq".to_string()),
            reason: "fastqc exited with code 1".to_string(),
        };
        ts.storage
            .compare_and_set_status(
                &run.id,
                &[RunStatus::Running],
                RunStatus::Failed,
                Some(&failure),
            )
            .await
            .unwrap();

        let failed = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.failed_step.as_deref(), Some("/data/a.fastq"));
        assert_eq!(failed.error.as_deref(), Some("fastqc exited with code 1"));
    }

    #[tokio::test]
    async fn compare_and_set_missing_run_is_false() {
        let ts = create_test_storage().await;
        let changed = ts
            .storage
            .compare_and_set_status(
                &Id::from_string("missing"),
                &[RunStatus::Pending],
                RunStatus::Running,
                None,
            )
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn compare_and_set_with_no_predecessors_is_noop() {
        let ts = create_test_storage().await;
        let run = ts.storage.create_run(&[], "", "fastqc").await.unwrap();
        let changed = ts
            .storage
            .compare_and_set_status(&run.id, &[], RunStatus::Pending, None)
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn status_check_constraint_rejects_unknown_values() {
        let ts = create_test_storage().await;
        let run = ts.storage.create_run(&[], "", "fastqc").await.unwrap();

        let result = sqlx::query("UPDATE runs SET status = 'bogus' WHERE run_id = ?1")
            .bind(run.id.as_ref())
            .execute(&ts.storage.pool)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn corrupt_input_files_is_decode_error() {
        let ts = create_test_storage().await;
        let run = ts.storage.create_run(&[], "", "fastqc").await.unwrap();
        sqlx::query("UPDATE runs SET input_files = 'not json' WHERE run_id = ?1")
            .bind(run.id.as_ref())
            .execute(&ts.storage.pool)
            .await
            .unwrap();

        let result = ts.storage.get_run(&run.id).await;
        assert!(matches!(result, Err(StorageError::Decode { .. })));
    }

    #[tokio::test]
    async fn list_runs_with_status_filters() {
        let ts = create_test_storage().await;
        let pending = ts.storage.create_run(&[], "", "fastqc").await.unwrap();
        let running = ts.storage.create_run(&[], "", "fastqc").await.unwrap();
        ts.storage
            .compare_and_set_status(&running.id, &[RunStatus::Pending], RunStatus::Running, None)
            .await
            .unwrap();

        let runs = ts
            .storage
            .list_runs_with_status(RunStatus::Running)
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, running.id);

        let runs = ts
            .storage
            .list_runs_with_status(RunStatus::Pending)
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, pending.id);
    }

    #[tokio::test]
    async fn discard_only_removes_pending_runs() {
        let ts = create_test_storage().await;
        let pending = ts.storage.create_run(&[], "", "fastqc").await.unwrap();
        let running = ts.storage.create_run(&[], "", "fastqc").await.unwrap();
        ts.storage
            .compare_and_set_status(&running.id, &[RunStatus::Pending], RunStatus::Running, None)
            .await
            .unwrap();

        assert!(ts.storage.discard_pending_run(&pending.id).await.unwrap());
        assert!(!ts.storage.discard_pending_run(&running.id).await.unwrap());

        assert!(matches!(
            ts.storage.get_run(&pending.id).await,
            Err(StorageError::RunNotFound(_))
        ));
        assert!(ts.storage.get_run(&running.id).await.is_ok());
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();
        ts.storage.migrate_embedded().await.unwrap();
    }
}
