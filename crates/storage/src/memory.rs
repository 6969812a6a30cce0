//! In-memory backend for tests and local runs.
//!
//! Writes made through a [`MemorySnapshot`] are staged and applied to the
//! shared state in one step on commit, under a single lock. Aborting or
//! dropping the snapshot discards them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::merge::{apply_run_update, apply_step_transition};
use crate::record::{
    EventKind, LogEntryRecord, NewRun, OutputPathSpec, RunRecord, RunUpdate, StepStatusRecord,
    StepTransition,
};
use crate::traits::SyncStorage;

type StepKey = (String, String);
type LogKey = (String, EventKind, OffsetDateTime);

#[derive(Default)]
struct MemoryState {
    next_run_id: i64,
    runs: BTreeMap<i64, RunRecord>,
    run_ids: HashMap<String, i64>,
    steps: BTreeMap<StepKey, StepStatusRecord>,
    logs: BTreeMap<LogKey, LogEntryRecord>,
    workflow_specs: HashMap<i64, OutputPathSpec>,
    cursor: Option<OffsetDateTime>,
    failing_commits: usize,
    commits: usize,
}

enum StagedWrite {
    Step {
        run_id: i64,
        external_run_id: String,
        transition: StepTransition,
    },
    Log(LogEntryRecord),
    Run {
        run_id: i64,
        update: RunUpdate,
    },
}

/// Staged writes of one in-progress transaction.
#[derive(Default)]
pub struct MemorySnapshot {
    writes: Vec<StagedWrite>,
}

/// [`SyncStorage`] kept entirely in process memory.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // Recover data even if the mutex was poisoned by a panic in another thread
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare how a workflow's runs name their output files.
    pub fn set_workflow_output_spec(&self, workflow_id: i64, spec: OutputPathSpec) {
        self.state().workflow_specs.insert(workflow_id, spec);
    }

    /// Make the next `count` commits fail with a backend error, discarding
    /// their staged writes.
    pub fn fail_next_commits(&self, count: usize) {
        self.state().failing_commits = count;
    }

    /// Number of successfully committed snapshots.
    pub fn commit_count(&self) -> usize {
        self.state().commits
    }
}

impl MemoryState {
    fn check_run(&self, run_id: i64) -> Result<(), StorageError> {
        if self.runs.contains_key(&run_id) {
            Ok(())
        } else {
            Err(StorageError::RunNotFound { run_id })
        }
    }

    fn apply(&mut self, write: StagedWrite) {
        match write {
            StagedWrite::Step {
                run_id,
                external_run_id,
                transition,
            } => {
                let key = (external_run_id.clone(), transition.step_code.clone());
                let next = apply_step_transition(
                    self.steps.get(&key),
                    run_id,
                    &external_run_id,
                    &transition,
                );
                self.steps.insert(key, next);
            }
            StagedWrite::Log(entry) => {
                let key = (entry.external_run_id.clone(), entry.event_kind, entry.timestamp);
                self.logs.insert(key, entry);
            }
            StagedWrite::Run { run_id, update } => {
                if let Some(current) = self.runs.get(&run_id) {
                    let next = apply_run_update(current, &update);
                    self.runs.insert(run_id, next);
                }
            }
        }
    }
}

#[async_trait]
impl SyncStorage for MemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        Ok(MemorySnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let mut state = self.state();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StorageError::Backend("injected commit failure".into()));
        }

        // Validate every write before applying any, so commit is all-or-nothing.
        for write in &snapshot.writes {
            match write {
                StagedWrite::Step { run_id, .. } | StagedWrite::Run { run_id, .. } => {
                    state.check_run(*run_id)?
                }
                StagedWrite::Log(entry) => state.check_run(entry.run_id)?,
            }
        }
        for write in snapshot.writes {
            state.apply(write);
        }
        state.commits += 1;
        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: MemorySnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn upsert_step(
        &self,
        snapshot: &mut MemorySnapshot,
        run_id: i64,
        external_run_id: &str,
        transition: &StepTransition,
    ) -> Result<(), StorageError> {
        self.state().check_run(run_id)?;
        snapshot.writes.push(StagedWrite::Step {
            run_id,
            external_run_id: external_run_id.to_string(),
            transition: transition.clone(),
        });
        Ok(())
    }

    async fn append_log(
        &self,
        snapshot: &mut MemorySnapshot,
        entry: LogEntryRecord,
    ) -> Result<(), StorageError> {
        self.state().check_run(entry.run_id)?;
        snapshot.writes.push(StagedWrite::Log(entry));
        Ok(())
    }

    async fn update_run(
        &self,
        snapshot: &mut MemorySnapshot,
        run_id: i64,
        update: RunUpdate,
    ) -> Result<(), StorageError> {
        self.state().check_run(run_id)?;
        snapshot.writes.push(StagedWrite::Run { run_id, update });
        Ok(())
    }

    async fn insert_run(&self, run: NewRun) -> Result<RunRecord, StorageError> {
        let mut state = self.state();
        if state.run_ids.contains_key(&run.external_run_id) {
            return Err(StorageError::DuplicateRun {
                external_run_id: run.external_run_id,
            });
        }
        state.next_run_id += 1;
        let record = RunRecord {
            id: state.next_run_id,
            external_run_id: run.external_run_id,
            workflow_id: run.workflow_id,
            status: run.status,
            started_at: run.started_at,
            finished_at: None,
            duration_seconds: None,
            error_message: None,
            output_locations: Vec::new(),
            run_config: run.run_config,
        };
        state
            .run_ids
            .insert(record.external_run_id.clone(), record.id);
        state.runs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_run(&self, external_run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        let state = self.state();
        Ok(state
            .run_ids
            .get(external_run_id)
            .and_then(|id| state.runs.get(id))
            .cloned())
    }

    async fn list_step_statuses(
        &self,
        external_run_id: &str,
    ) -> Result<Vec<StepStatusRecord>, StorageError> {
        Ok(self
            .state()
            .steps
            .values()
            .filter(|s| s.external_run_id == external_run_id)
            .cloned()
            .collect())
    }

    async fn list_logs(&self, external_run_id: &str) -> Result<Vec<LogEntryRecord>, StorageError> {
        let mut logs: Vec<LogEntryRecord> = self
            .state()
            .logs
            .values()
            .filter(|l| l.external_run_id == external_run_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.event_kind.cmp(&b.event_kind))
        });
        Ok(logs)
    }

    async fn workflow_output_spec(&self, workflow_id: i64) -> Result<OutputPathSpec, StorageError> {
        Ok(self
            .state()
            .workflow_specs
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_cursor(&self) -> Result<Option<OffsetDateTime>, StorageError> {
        Ok(self.state().cursor)
    }

    async fn store_cursor(&self, cursor: OffsetDateTime) -> Result<(), StorageError> {
        self.state().cursor = Some(cursor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DomainStatus, LogLevel, StepState};

    fn new_run(external_run_id: &str) -> NewRun {
        NewRun {
            external_run_id: external_run_id.into(),
            workflow_id: 7,
            status: DomainStatus::Queued,
            started_at: None,
            run_config: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn injected_commit_failure_discards_writes() {
        let storage = MemoryStorage::new();
        let run = storage.insert_run(new_run("r1")).await.unwrap();
        storage.fail_next_commits(1);

        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .upsert_step(
                &mut snap,
                run.id,
                "r1",
                &StepTransition {
                    step_code: "load".into(),
                    status: StepState::Started,
                    started_at: Some(OffsetDateTime::UNIX_EPOCH),
                    finished_at: None,
                    error_message: None,
                },
            )
            .await
            .unwrap();
        assert!(storage.commit_snapshot(snap).await.is_err());
        assert!(storage.list_step_statuses("r1").await.unwrap().is_empty());
        assert_eq!(storage.commit_count(), 0);

        // Next commit goes through.
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .append_log(
                &mut snap,
                LogEntryRecord {
                    run_id: run.id,
                    external_run_id: "r1".into(),
                    step_code: None,
                    event_kind: EventKind::Message,
                    message: "hello".into(),
                    level: LogLevel::Info,
                    timestamp: OffsetDateTime::UNIX_EPOCH,
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();
        assert_eq!(storage.list_logs("r1").await.unwrap().len(), 1);
        assert_eq!(storage.commit_count(), 1);
    }

    #[tokio::test]
    async fn workflow_output_spec_defaults_to_absent() {
        let storage = MemoryStorage::new();
        assert_eq!(
            storage.workflow_output_spec(1).await.unwrap(),
            OutputPathSpec::Absent
        );
        storage.set_workflow_output_spec(
            1,
            OutputPathSpec::Pattern {
                pattern: "out/{batch_name}".into(),
            },
        );
        assert!(matches!(
            storage.workflow_output_spec(1).await.unwrap(),
            OutputPathSpec::Pattern { .. }
        ));
    }
}
