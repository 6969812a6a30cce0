//! Fake execution engine and fixtures shared by the sync tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};

use runsync_core::{SyncOrchestrator, SyncSettings};
use runsync_engine::{EngineError, ExecutionEngine, RunDetail, RunSummary};
use runsync_storage::{DomainStatus, MemoryStorage, NewRun, RunRecord, SyncStorage};

pub fn ts(secs: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(secs)
}

/// Initial "now" of every harness clock.
pub const NOW_SECS: i64 = 1_000_000;

#[derive(Default)]
struct FakeState {
    runs: HashMap<String, RunDetail>,
    failing: HashSet<String>,
}

/// In-process engine serving canned run details.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    detail_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl FakeEngine {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Publish (or replace) a run.
    pub fn put_run(
        &self,
        run_id: &str,
        status: &str,
        update_secs: i64,
        config: Value,
        events: Vec<Value>,
    ) {
        let detail = RunDetail {
            run_id: run_id.to_string(),
            status: status.to_string(),
            start_time: None,
            end_time: None,
            update_time: Some(ts(update_secs)),
            config,
            events,
        };
        self.state().runs.insert(run_id.to_string(), detail);
    }

    pub fn edit_run(&self, run_id: &str, edit: impl FnOnce(&mut RunDetail)) {
        if let Some(detail) = self.state().runs.get_mut(run_id) {
            edit(detail);
        }
    }

    /// Make every query for this run fail as if the engine were unreachable.
    pub fn fail_run(&self, run_id: &str) {
        self.state().failing.insert(run_id.to_string());
    }

    pub fn heal_run(&self, run_id: &str) {
        self.state().failing.remove(run_id);
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionEngine for FakeEngine {
    async fn get_run_detail(&self, external_run_id: &str) -> Result<RunDetail, EngineError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.failing.contains(external_run_id) {
            return Err(EngineError::Http { status: 503 });
        }
        state
            .runs
            .get(external_run_id)
            .cloned()
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: external_run_id.to_string(),
            })
    }

    async fn list_recently_updated_runs(
        &self,
        limit: usize,
        updated_after: Option<OffsetDateTime>,
        updated_before: Option<OffsetDateTime>,
    ) -> Result<Vec<RunSummary>, EngineError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        let mut runs: Vec<RunSummary> = state
            .runs
            .values()
            .filter_map(|d| {
                let update_time = d.update_time?;
                Some(RunSummary {
                    run_id: d.run_id.clone(),
                    status: d.status.clone(),
                    update_time,
                    tags: BTreeMap::new(),
                })
            })
            .filter(|r| updated_after.map_or(true, |after| r.update_time > after))
            .filter(|r| updated_before.map_or(true, |before| r.update_time <= before))
            .collect();
        runs.sort_by(|a, b| {
            b.update_time
                .cmp(&a.update_time)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        runs.truncate(limit);
        Ok(runs)
    }
}

pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub storage: Arc<MemoryStorage>,
    pub orchestrator: SyncOrchestrator<FakeEngine, MemoryStorage>,
    now: Arc<AtomicI64>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SyncSettings::default())
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        let engine = Arc::new(FakeEngine::default());
        let storage = Arc::new(MemoryStorage::new());
        let now = Arc::new(AtomicI64::new(NOW_SECS));
        let clock_now = Arc::clone(&now);
        let orchestrator =
            SyncOrchestrator::new(Arc::clone(&engine), Arc::clone(&storage), settings)
                .with_clock(move || ts(clock_now.load(Ordering::SeqCst)));
        Self {
            engine,
            storage,
            orchestrator,
            now,
        }
    }

    /// Move the orchestrator clock to `secs` after the epoch.
    pub fn set_now(&self, secs: i64) {
        self.now.store(secs, Ordering::SeqCst);
    }

    /// Record a run locally, as the launch path would.
    pub async fn launch(&self, run_id: &str, workflow_id: i64) -> RunRecord {
        self.storage
            .insert_run(NewRun {
                external_run_id: run_id.to_string(),
                workflow_id,
                status: DomainStatus::Queued,
                started_at: None,
                run_config: json!({}),
            })
            .await
            .unwrap()
    }

    pub async fn run(&self, run_id: &str) -> RunRecord {
        self.storage.find_run(run_id).await.unwrap().unwrap()
    }
}

// ── Event builders ──────────────────────────────────────────────────────────

pub fn step_start(step: &str, t: i64) -> Value {
    json!({
        "__typename": "ExecutionStepStartEvent",
        "stepKey": step,
        "timestamp": t.to_string(),
        "level": "DEBUG",
        "message": format!("Started execution of step \"{step}\"."),
    })
}

pub fn step_success(step: &str, t: i64) -> Value {
    json!({
        "__typename": "ExecutionStepSuccessEvent",
        "stepKey": step,
        "timestamp": t.to_string(),
        "level": "DEBUG",
        "message": format!("Finished execution of step \"{step}\"."),
    })
}

pub fn step_failure(step: &str, t: i64, error: &str) -> Value {
    json!({
        "__typename": "ExecutionStepFailureEvent",
        "stepKey": step,
        "timestamp": t.to_string(),
        "level": "ERROR",
        "message": format!("Execution of step \"{step}\" failed."),
        "error": {"message": error},
    })
}

pub fn log_message(t: i64, message: &str) -> Value {
    json!({
        "__typename": "LogMessageEvent",
        "timestamp": t.to_string(),
        "level": "INFO",
        "message": message,
    })
}
