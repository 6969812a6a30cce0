//! PostgreSQL backend for [`SyncStorage`].
//!
//! Each snapshot is a `sqlx` transaction. Step and run writes lock the current
//! row with `SELECT ... FOR UPDATE`, merge in Rust with the shared rules from
//! [`runsync_storage::merge`], and write back with an `ON CONFLICT` upsert.
//! The upsert repeats the monotonicity guard in SQL so two transactions that
//! both saw no row cannot regress a terminal step.

mod rows;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tracing::{debug, warn};

use runsync_storage::merge::{apply_run_update, apply_step_transition};
use runsync_storage::{
    LogEntryRecord, NewRun, OutputPathSpec, OutputTemplate, RunRecord, RunUpdate, StepStatusRecord,
    StepTransition, StorageError, SyncStorage,
};

use rows::{log_from_row, run_from_row, step_from_row, LOG_COLUMNS, RUN_COLUMNS, STEP_COLUMNS};

pub(crate) fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// [`SyncStorage`] on a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool. Does not run migrations; call [`Self::migrate`].
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(backend)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        debug!("schema migrations applied");
        Ok(())
    }

    /// Delete every row the backend owns. Used to isolate tests.
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            TRUNCATE run_logs,
                     step_statuses,
                     runs,
                     workflows,
                     sync_cursor
            RESTART IDENTITY
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// Declare how a workflow's runs name their output files.
    pub async fn set_workflow_output_spec(
        &self,
        workflow_id: i64,
        spec: &OutputPathSpec,
    ) -> Result<(), StorageError> {
        let (templates, pattern) = match spec {
            OutputPathSpec::Templates { templates } => {
                (Some(serde_json::to_value(templates)?), None)
            }
            OutputPathSpec::Pattern { pattern } => (None, Some(pattern.as_str())),
            OutputPathSpec::Absent => (None, None),
        };
        sqlx::query(
            r#"
            INSERT INTO workflows (id, output_path_templates, output_path_pattern)
            VALUES ($1, $2, $3)
            ON CONFLICT (id)
            DO UPDATE SET
                output_path_templates = EXCLUDED.output_path_templates,
                output_path_pattern = EXCLUDED.output_path_pattern
            "#,
        )
        .bind(workflow_id)
        .bind(templates)
        .bind(pattern)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn ensure_run(
        tx: &mut Transaction<'static, Postgres>,
        run_id: i64,
    ) -> Result<(), StorageError> {
        let found = sqlx::query("SELECT id FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(backend)?;
        match found {
            Some(_) => Ok(()),
            None => Err(StorageError::RunNotFound { run_id }),
        }
    }
}

#[async_trait]
impl SyncStorage for PostgresStorage {
    type Snapshot = Transaction<'static, Postgres>;

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError> {
        self.pool.begin().await.map_err(backend)
    }

    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError> {
        snapshot.commit().await.map_err(backend)
    }

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError> {
        snapshot.rollback().await.map_err(backend)
    }

    async fn upsert_step(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: i64,
        external_run_id: &str,
        transition: &StepTransition,
    ) -> Result<(), StorageError> {
        Self::ensure_run(snapshot, run_id).await?;

        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM step_statuses \
             WHERE external_run_id = $1 AND step_code = $2 FOR UPDATE"
        );
        let existing = sqlx::query(&sql)
            .bind(external_run_id)
            .bind(&transition.step_code)
            .fetch_optional(&mut **snapshot)
            .await
            .map_err(backend)?
            .map(|row| step_from_row(&row))
            .transpose()?;

        let next = apply_step_transition(existing.as_ref(), run_id, external_run_id, transition);
        if existing.as_ref() == Some(&next) {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO step_statuses (
                run_id,
                external_run_id,
                step_code,
                status,
                started_at,
                finished_at,
                duration_seconds,
                error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_run_id, step_code)
            DO UPDATE SET
                status = EXCLUDED.status,
                started_at = COALESCE(EXCLUDED.started_at, step_statuses.started_at),
                finished_at = COALESCE(EXCLUDED.finished_at, step_statuses.finished_at),
                duration_seconds = COALESCE(
                    EXCLUDED.duration_seconds,
                    EXTRACT(EPOCH FROM (
                        COALESCE(EXCLUDED.finished_at, step_statuses.finished_at)
                        - COALESCE(EXCLUDED.started_at, step_statuses.started_at)
                    ))::DOUBLE PRECISION,
                    step_statuses.duration_seconds
                ),
                error_message = COALESCE(EXCLUDED.error_message, step_statuses.error_message)
            WHERE NOT (
                (step_statuses.status IN ('SUCCESS', 'FAILURE') AND EXCLUDED.status = 'STARTED')
                OR (step_statuses.status = 'FAILURE' AND EXCLUDED.status = 'SUCCESS')
            )
            "#,
        )
        .bind(next.run_id)
        .bind(&next.external_run_id)
        .bind(&next.step_code)
        .bind(next.status.as_str())
        .bind(next.started_at)
        .bind(next.finished_at)
        .bind(next.duration_seconds)
        .bind(next.error_message.as_deref())
        .execute(&mut **snapshot)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn append_log(
        &self,
        snapshot: &mut Self::Snapshot,
        entry: LogEntryRecord,
    ) -> Result<(), StorageError> {
        Self::ensure_run(snapshot, entry.run_id).await?;
        sqlx::query(
            r#"
            INSERT INTO run_logs (
                run_id,
                external_run_id,
                step_code,
                event_type,
                message,
                level,
                logged_at,
                payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_run_id, event_type, logged_at)
            DO UPDATE SET
                run_id = EXCLUDED.run_id,
                step_code = EXCLUDED.step_code,
                message = EXCLUDED.message,
                level = EXCLUDED.level,
                payload = EXCLUDED.payload
            "#,
        )
        .bind(entry.run_id)
        .bind(&entry.external_run_id)
        .bind(entry.step_code.as_deref())
        .bind(entry.event_kind.as_str())
        .bind(&entry.message)
        .bind(entry.level.as_str())
        .bind(entry.timestamp)
        .bind(&entry.payload)
        .execute(&mut **snapshot)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn update_run(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: i64,
        update: RunUpdate,
    ) -> Result<(), StorageError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1 FOR UPDATE");
        let current = match sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&mut **snapshot)
            .await
            .map_err(backend)?
        {
            Some(row) => run_from_row(&row)?,
            None => return Err(StorageError::RunNotFound { run_id }),
        };

        let next = apply_run_update(&current, &update);
        if next == current {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE runs
            SET status = $2,
                started_at = $3,
                finished_at = $4,
                duration_seconds = $5,
                error_message = $6,
                output_locations = $7,
                run_config = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(next.status.as_str())
        .bind(next.started_at)
        .bind(next.finished_at)
        .bind(next.duration_seconds)
        .bind(next.error_message.as_deref())
        .bind(serde_json::to_value(&next.output_locations)?)
        .bind(&next.run_config)
        .execute(&mut **snapshot)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn insert_run(&self, run: NewRun) -> Result<RunRecord, StorageError> {
        let sql = format!(
            "INSERT INTO runs (external_run_id, workflow_id, status, started_at, run_config) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {RUN_COLUMNS}"
        );
        let result = sqlx::query(&sql)
            .bind(&run.external_run_id)
            .bind(run.workflow_id)
            .bind(run.status.as_str())
            .bind(run.started_at)
            .bind(&run.run_config)
            .fetch_one(&self.pool)
            .await;
        match result {
            Ok(row) => run_from_row(&row),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::DuplicateRun {
                    external_run_id: run.external_run_id,
                })
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn find_run(&self, external_run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE external_run_id = $1");
        sqlx::query(&sql)
            .bind(external_run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(|row| run_from_row(&row))
            .transpose()
    }

    async fn list_step_statuses(
        &self,
        external_run_id: &str,
    ) -> Result<Vec<StepStatusRecord>, StorageError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM step_statuses \
             WHERE external_run_id = $1 ORDER BY step_code"
        );
        sqlx::query(&sql)
            .bind(external_run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(step_from_row)
            .collect()
    }

    async fn list_logs(&self, external_run_id: &str) -> Result<Vec<LogEntryRecord>, StorageError> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM run_logs \
             WHERE external_run_id = $1 ORDER BY logged_at, event_type"
        );
        sqlx::query(&sql)
            .bind(external_run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(log_from_row)
            .collect()
    }

    async fn workflow_output_spec(&self, workflow_id: i64) -> Result<OutputPathSpec, StorageError> {
        let row: Option<(Option<serde_json::Value>, Option<String>)> = sqlx::query_as(
            "SELECT output_path_templates, output_path_pattern FROM workflows WHERE id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some((templates, pattern)) = row else {
            return Ok(OutputPathSpec::Absent);
        };
        let templates = match templates.map(serde_json::from_value::<Vec<OutputTemplate>>) {
            Some(Ok(parsed)) => Some(parsed),
            Some(Err(e)) => {
                warn!(workflow_id, error = %e, "ignoring malformed output path templates");
                None
            }
            None => None,
        };
        Ok(OutputPathSpec::from_parts(templates, pattern))
    }

    async fn load_cursor(&self) -> Result<Option<OffsetDateTime>, StorageError> {
        let row: Option<(OffsetDateTime,)> =
            sqlx::query_as("SELECT last_update_time FROM sync_cursor WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(row.map(|(ts,)| ts))
    }

    async fn store_cursor(&self, cursor: OffsetDateTime) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursor (id, last_update_time)
            VALUES (1, $1)
            ON CONFLICT (id)
            DO UPDATE SET last_update_time = EXCLUDED.last_update_time
            "#,
        )
        .bind(cursor)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}
