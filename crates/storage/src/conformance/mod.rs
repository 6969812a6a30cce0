//! Conformance test suite for `SyncStorage` implementations.
//!
//! Any backend can run this suite to check it honours the storage contract:
//!
//! - **Runs**: registration, lookup, terminal stickiness of run updates
//! - **Snapshot isolation**: uncommitted writes invisible, aborted writes discarded
//! - **Atomic commit**: a run's step, log and run writes land together
//! - **Step merge**: status monotonicity and timestamp filling
//! - **Logs**: replacement on the (run, kind, timestamp) key, ordering
//! - **Cursor**: load/store of the sync cursor
//! - **Error handling**: correct error variants for invalid operations
//! - **Concurrency**: parallel writers on shared handles
//!
//! # Usage
//!
//! Pass a factory that yields an empty backend; it is called once per test.
//! The memory backend runs it in `tests/memory_conformance.rs`:
//!
//! ```ignore
//! let report = run_conformance_suite(|| async { MemoryStorage::new() }).await;
//! assert_eq!(report.failed, 0, "{report}");
//! ```

mod commit;
mod concurrent;
mod cursor;
mod error;
mod log;
mod run;
mod snapshot;
mod step;

use std::fmt;
use std::future::Future;

use time::{Duration, OffsetDateTime};

use crate::record::{
    DomainStatus, EventKind, LogEntryRecord, LogLevel, NewRun, RunRecord, StepState,
    StepTransition,
};
use crate::SyncStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "run", "snapshot", "step").
    pub category: String,
    /// Test name (e.g. "insert_run_assigns_id").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in self.results.iter().filter(|r| !r.passed) {
            writeln!(
                f,
                "  FAIL [{}/{}]: {}",
                r.category,
                r.name,
                r.message.as_deref().unwrap_or("(no message)")
            )?;
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(run::run_run_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(step::run_step_tests(&factory).await);
    results.extend(log::run_log_tests(&factory).await);
    results.extend(cursor::run_cursor_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Whole seconds past a fixed base, so every backend stores them exactly.
fn ts(secs: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + secs)
}

fn make_new_run(external_run_id: &str) -> NewRun {
    NewRun {
        external_run_id: external_run_id.to_string(),
        workflow_id: 7,
        status: DomainStatus::Queued,
        started_at: None,
        run_config: serde_json::json!({"ops": {"save": {"config": {"batch_name": "b1"}}}}),
    }
}

async fn seed_run<S: SyncStorage>(s: &S, external_run_id: &str) -> Result<RunRecord, String> {
    s.insert_run(make_new_run(external_run_id))
        .await
        .map_err(|e| e.to_string())
}

fn step_started(code: &str, at: i64) -> StepTransition {
    StepTransition {
        step_code: code.to_string(),
        status: StepState::Started,
        started_at: Some(ts(at)),
        finished_at: None,
        error_message: None,
    }
}

fn step_finished(code: &str, status: StepState, at: i64, error: Option<&str>) -> StepTransition {
    StepTransition {
        step_code: code.to_string(),
        status,
        started_at: None,
        finished_at: Some(ts(at)),
        error_message: error.map(str::to_string),
    }
}

fn make_log(run: &RunRecord, kind: EventKind, at: i64, message: &str) -> LogEntryRecord {
    LogEntryRecord {
        run_id: run.id,
        external_run_id: run.external_run_id.clone(),
        step_code: None,
        event_kind: kind,
        message: message.to_string(),
        level: LogLevel::Info,
        timestamp: ts(at),
        payload: serde_json::json!({"message": message}),
    }
}

/// Apply one step transition in its own committed snapshot.
async fn commit_step<S: SyncStorage>(
    s: &S,
    run: &RunRecord,
    transition: &StepTransition,
) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.upsert_step(&mut snap, run.id, &run.external_run_id, transition)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}
