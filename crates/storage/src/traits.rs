use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    LogEntryRecord, NewRun, OutputPathSpec, RunRecord, RunUpdate, StepStatusRecord,
    StepTransition,
};

/// The state-store trait for run status synchronization.
///
/// A `SyncStorage` implementation keeps the local snapshot of runs, step
/// statuses and log entries, and the process-wide sync cursor.
///
/// ## Snapshot Semantics
///
/// All sync mutations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()` : start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)` : commit and consume the transaction
///    OR `abort_snapshot(snapshot)` : roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the underlying transaction
/// MUST be rolled back. One snapshot covers exactly one run's writes, so a
/// failure leaves that run's previous state untouched.
///
/// ## Idempotence
///
/// `upsert_step`, `append_log` and `update_run` must produce the same end
/// state however many times they are applied with the same input. The
/// conflict rules live in [`crate::merge`]; backends must apply them.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` so one handle can be shared
/// by the periodic driver and on-demand handlers.
#[async_trait]
pub trait SyncStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all mutations.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Sync mutations (within snapshot) ─────────────────────────────────────

    /// Insert or update the status of `(external_run_id, transition.step_code)`
    /// following [`crate::merge::apply_step_transition`].
    async fn upsert_step(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: i64,
        external_run_id: &str,
        transition: &StepTransition,
    ) -> Result<(), StorageError>;

    /// Insert a log entry, replacing any entry with the same
    /// (external run id, event kind, timestamp).
    async fn append_log(
        &self,
        snapshot: &mut Self::Snapshot,
        entry: LogEntryRecord,
    ) -> Result<(), StorageError>;

    /// Update the provided fields of a run following
    /// [`crate::merge::apply_run_update`].
    ///
    /// Returns `Err(StorageError::RunNotFound)` if no run has this id, either
    /// immediately or when the snapshot is committed.
    async fn update_run(
        &self,
        snapshot: &mut Self::Snapshot,
        run_id: i64,
        update: RunUpdate,
    ) -> Result<(), StorageError>;

    // ── Run registration (outside snapshot) ──────────────────────────────────

    /// Record a newly launched run. Normally called by the launch path, not
    /// by sync.
    ///
    /// Returns `Err(StorageError::DuplicateRun)` if the external id exists.
    async fn insert_run(&self, run: NewRun) -> Result<RunRecord, StorageError>;

    // ── Query operations (outside snapshot) ──────────────────────────────────

    /// Look up a run by the engine's run id.
    async fn find_run(&self, external_run_id: &str) -> Result<Option<RunRecord>, StorageError>;

    /// All step statuses of a run, ordered by step code.
    async fn list_step_statuses(
        &self,
        external_run_id: &str,
    ) -> Result<Vec<StepStatusRecord>, StorageError>;

    /// All log entries of a run, ordered by timestamp.
    async fn list_logs(&self, external_run_id: &str) -> Result<Vec<LogEntryRecord>, StorageError>;

    /// The output path declaration of a workflow; `Absent` when the workflow
    /// declares none or is unknown.
    async fn workflow_output_spec(&self, workflow_id: i64) -> Result<OutputPathSpec, StorageError>;

    // ── Sync cursor ──────────────────────────────────────────────────────────

    /// The last fully processed run-update timestamp, `None` before the
    /// first successful tick.
    async fn load_cursor(&self) -> Result<Option<OffsetDateTime>, StorageError>;

    /// Persist a new cursor value.
    async fn store_cursor(&self, cursor: OffsetDateTime) -> Result<(), StorageError>;
}
