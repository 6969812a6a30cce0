//! Persistence gateway.
//!
//! Writes everything derived from one run inside a single storage snapshot.
//! Either the whole plan is committed or, on any error, the snapshot is
//! aborted and the run's previously stored state is left untouched.

use serde::Serialize;

use runsync_storage::{LogEntryRecord, RunUpdate, StepTransition, StorageError, SyncStorage};

/// All writes for one run, in the order they are applied.
#[derive(Debug, Clone, Default)]
pub struct RunPersistPlan {
    pub run_id: i64,
    pub external_run_id: String,
    /// Step transitions in engine event order.
    pub transitions: Vec<StepTransition>,
    pub logs: Vec<LogEntryRecord>,
    pub update: RunUpdate,
}

/// Counts of what one committed plan wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistSummary {
    pub step_transitions: usize,
    pub log_entries: usize,
}

/// Apply a plan atomically.
pub async fn persist_run<S: SyncStorage>(
    storage: &S,
    plan: RunPersistPlan,
) -> Result<PersistSummary, StorageError> {
    let mut snapshot = storage.begin_snapshot().await?;

    for transition in &plan.transitions {
        if let Err(e) = storage
            .upsert_step(&mut snapshot, plan.run_id, &plan.external_run_id, transition)
            .await
        {
            let _ = storage.abort_snapshot(snapshot).await;
            return Err(e);
        }
    }

    let log_entries = plan.logs.len();
    for entry in plan.logs {
        if let Err(e) = storage.append_log(&mut snapshot, entry).await {
            let _ = storage.abort_snapshot(snapshot).await;
            return Err(e);
        }
    }

    if let Err(e) = storage
        .update_run(&mut snapshot, plan.run_id, plan.update)
        .await
    {
        let _ = storage.abort_snapshot(snapshot).await;
        return Err(e);
    }

    storage.commit_snapshot(snapshot).await?;

    Ok(PersistSummary {
        step_transitions: plan.transitions.len(),
        log_entries,
    })
}
